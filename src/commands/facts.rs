//! `deckhand facts` - show gathered host facts

use anyhow::Result;

use crate::facts::Facts;
use crate::ui;

pub fn run(json: bool, local: bool) -> Result<()> {
    let facts = if local {
        Facts::gather_local()?
    } else {
        Facts::gather()?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&facts)?);
        return Ok(());
    }

    ui::header("Host facts");
    ui::kv("hostname", &facts.hostname);
    ui::kv("user", &facts.user);
    ui::kv("os", &facts.os_name);

    match &facts.instance {
        Some(instance) => {
            ui::kv("instance", &instance.instance_id);
            if let Some(ip) = &instance.public_ipv4 {
                ui::kv("public ip", ip);
            }
        }
        None if !local => ui::dim("no instance metadata (not a cloud host?)"),
        None => {}
    }

    Ok(())
}
