//! Text-lane commands.
//!
//! A fixed command set plus an escape hatch: a first token that parses as a
//! numeric message type is dispatched through the binary path with an
//! optional JSON body.

use std::sync::Arc;

use bytes::Bytes;

use gated_core::error::Result;
use gated_core::protocol::resp::{self, Printer, ARRAY};
use gated_core::protocol::types::MsgType;

use crate::frontend::session::{Session, SessionHandler};
use crate::frontend::FrontendModule;

struct CommandSpec {
    name: &'static str,
    format: &'static str,
    usage: &'static str,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "command",
        format: "[commands...]",
        usage: "show commands help information",
    },
    CommandSpec { name: "echo", format: "[content]", usage: "echo content" },
    CommandSpec { name: "ping", format: "", usage: "ping the server" },
    CommandSpec {
        name: "send",
        format: "<type> [json]",
        usage: "send message by type with json formatted content",
    },
];

fn lookup(name: &str) -> Option<&'static CommandSpec> {
    let lower = name.to_lowercase();
    COMMANDS.iter().find(|c| c.name == lower)
}

pub(super) async fn dispatch(
    frontend: &FrontendModule,
    s: &Arc<Session>,
    args: Vec<String>,
) -> Result<()> {
    let name = args[0].to_lowercase();
    match name.as_str() {
        "command" => help(s, &args[1..]).await,
        "ping" => {
            let mut p = Printer::new();
            p.println(&["pong"]);
            s.write_line(p.take()).await
        }
        "echo" => {
            let mut p = Printer::new();
            let parts: Vec<&str> = args[1..].iter().map(String::as_str).collect();
            p.println(&parts);
            s.write_line(p.take()).await
        }
        "send" => {
            if args.len() < 2 {
                return s.write_line(resp::error_line(&["argument <type> required"])).await;
            }
            let Ok(typ) = args[1].parse::<MsgType>() else {
                return s.write_line(resp::error_line(&["argument <type> invalid"])).await;
            };
            typed(frontend, s, typ, &args[2..]).await
        }
        _ => {
            let Ok(typ) = name.parse::<MsgType>() else {
                return s
                    .write_line(resp::error_line(&[
                        "command",
                        args[0].as_str(),
                        "not found, run command to list all supported commands",
                    ]))
                    .await;
            };
            typed(frontend, s, typ, &args[1..]).await
        }
    }
}

/// Dispatch a typed message through the binary path with 0 or 1 JSON body.
async fn typed(
    frontend: &FrontendModule,
    s: &Arc<Session>,
    typ: MsgType,
    args: &[String],
) -> Result<()> {
    match args {
        [] => frontend.on_message(s, typ, Bytes::new()).await,
        [json] => frontend.on_message(s, typ, Bytes::from(json.clone())).await,
        _ => s.write_line(resp::error_line(&["wrong number of arguments"])).await,
    }
}

/// `command [names...]`: list commands as an RESP array with the usage
/// column aligned.
async fn help(s: &Arc<Session>, names: &[String]) -> Result<()> {
    let mut cmds: Vec<&CommandSpec> = Vec::new();
    if names.is_empty() {
        cmds.extend(COMMANDS.iter());
    } else {
        for name in names {
            let Some(c) = lookup(name) else {
                return s
                    .write_line(resp::error_line(&["command", name.as_str(), "not found"]))
                    .await;
            };
            cmds.push(c);
        }
    }

    let mut p = Printer::with_type(ARRAY);
    let count = cmds.len().to_string();
    p.println(&[count.as_str()]);

    let left_of = |c: &CommandSpec| {
        if c.format.is_empty() {
            format!("+{}", c.name)
        } else {
            format!("+{} {}", c.name, c.format)
        }
    };
    let align = cmds.iter().map(|c| left_of(c).len()).max().unwrap_or(0);
    for c in &cmds {
        let left = left_of(c);
        let pad = " ".repeat(align - left.len() + 4);
        let row = format!("{left}{pad}{}", c.usage);
        p.println(&[row.as_str()]);
    }
    s.write_line(p.take()).await
}
