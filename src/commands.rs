//! Command execution against the session registry.

use crate::protocol::{parse, Command, Reply};
use crate::registry::Registry;
use crate::session::{truncate_name, SlotId};
use tracing::{debug, info};

/// What the connection handler should do after a line is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Parse and execute one line received from `slot`.
pub fn interpret(registry: &Registry, slot: SlotId, line: &str) -> Flow {
    match parse(line) {
        Ok(Some(command)) => execute(registry, slot, command),
        Ok(None) => Flow::Continue,
        Err(e) => {
            debug!(%slot, error = %e, "Usage error");
            registry.send_to(slot, e.reply());
            Flow::Continue
        }
    }
}

/// Execute a parsed command on behalf of `slot`.
pub fn execute(registry: &Registry, slot: SlotId, command: Command) -> Flow {
    match command {
        Command::Quit => return Flow::Quit,

        Command::Rename { name } => {
            if let Some((old, new)) = registry.rename(slot, &name) {
                registry.broadcast(&Reply::renamed(&old, &new), None);
                info!(%slot, old = %old, new = %new, "Renamed");
            }
        }

        Command::List => {
            let roster = registry.roster();
            let reply = Reply::roster(
                roster
                    .iter()
                    .map(|(id, name)| (name.as_str(), *id == slot)),
            );
            registry.send_to(slot, &reply);
        }

        Command::Whisper { target, text } => {
            let Some(from) = registry.name_of(slot) else {
                return Flow::Continue;
            };
            // Names are stored truncated, so look them up the same way
            let target = truncate_name(&target);
            let reply = match registry.find_by_name(target) {
                Some(to) if registry.send_to(to, &Reply::whisper_received(&from, &text)) => {
                    debug!(from = %from, to = %target, "Private message");
                    Reply::whisper_sent(target, &text)
                }
                Some(to) => {
                    // The failed send took the target offline
                    debug!(from = %from, to = %target, slot = %to, "Private message dropped");
                    Reply::user_not_found(target)
                }
                None => Reply::user_not_found(target),
            };
            registry.send_to(slot, &reply);
        }

        Command::Say { text } => {
            let Some(name) = registry.name_of(slot) else {
                return Flow::Continue;
            };
            let recipients = registry.broadcast(&Reply::chat(&name, &text), Some(slot));
            debug!(%slot, name = %name, recipients, "Chat message");
        }
    }

    Flow::Continue
}
