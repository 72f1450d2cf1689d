//! Command-line interface and REPL
//!
//! Operator console for a running session: write to the displays, set button
//! lights, ping the device with echoes and inspect the connection state.

use anyhow::{bail, Context, Result};
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::encode::{ButtonGroup, DisplayTarget, LightLevel};
use crate::exchange::ExchangePair;
use crate::protocol::{BUTTON_COUNT, MAX_FIELD};
use crate::runtime::SessionHandle;

/// A parsed console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Display { target: DisplayTarget, text: String },
    Button { group: ButtonGroup, button: u8, level: LightLevel },
    Echo(u16),
    Send(ExchangePair),
    Status,
    Help,
    Quit,
}

const HELP: &str = "\
Commands:
  display <target> <text>             write text to a display
                                      (ork, vk0, vk1, chars:<line>:<half>,
                                       dots:<line>:<half>; line/half 0 or 1)
  button <ork|vk|vkalt> <n> <level>   set a light (off, held, blink, on)
  echo <value>                        ask the device to echo a value
  send <param> <value>                send a raw exchange
  status                              show connection state
  help                                this text
  quit                                stop the session";

/// Parse one console line. Numbers accept decimal or `0x` hex.
pub fn parse_command(line: &str) -> Result<ReplCommand> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim_start();
    let args: Vec<&str> = rest.split_whitespace().collect();

    match word.to_lowercase().as_str() {
        "display" | "d" => {
            let (target, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if target.is_empty() {
                bail!("usage: display <target> <text>");
            }
            Ok(ReplCommand::Display {
                target: target.parse()?,
                text: text.to_string(),
            })
        }
        "button" | "b" => {
            let &[group, button, level] = args.as_slice() else {
                bail!("usage: button <ork|vk|vkalt> <n> <level>");
            };
            let button = parse_number(button)?;
            if button >= BUTTON_COUNT as u16 {
                bail!("Button {} out of range (0-{})", button, BUTTON_COUNT - 1);
            }
            Ok(ReplCommand::Button {
                group: group.parse()?,
                button: button as u8,
                level: level.parse()?,
            })
        }
        "echo" => {
            let &[value] = args.as_slice() else {
                bail!("usage: echo <value>");
            };
            Ok(ReplCommand::Echo(parse_field(value)?))
        }
        "send" => {
            let &[parameter, value] = args.as_slice() else {
                bail!("usage: send <param> <value>");
            };
            Ok(ReplCommand::Send(ExchangePair::new(
                parse_field(parameter)?,
                parse_field(value)?,
            )))
        }
        "status" | "s" => Ok(ReplCommand::Status),
        "help" | "?" => Ok(ReplCommand::Help),
        "quit" | "exit" | "q" => Ok(ReplCommand::Quit),
        other => bail!("Unknown command '{}', try 'help'", other),
    }
}

fn parse_number(s: &str) -> Result<u16> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.with_context(|| format!("Invalid number '{}'", s))
}

/// A 14-bit exchange field
fn parse_field(s: &str) -> Result<u16> {
    let value = parse_number(s)?;
    if value > MAX_FIELD {
        bail!("{} does not fit in 14 bits (max {:#06X})", value, MAX_FIELD);
    }
    Ok(value)
}

/// Run the console until `quit` or end of input, then shut the session down.
///
/// Line editing blocks, so the loop runs on a blocking thread and bridges back
/// into the runtime for state queries.
pub async fn run_repl(session: SessionHandle) -> Result<()> {
    let runtime = tokio::runtime::Handle::current();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut rl = DefaultEditor::new()?;
        println!("{}", "KBI-1 console, type 'help' for commands".cyan());

        loop {
            let line = match rl.readline("kbi> ") {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            };
            if line.trim().is_empty() {
                continue;
            }
            let _ = rl.add_history_entry(line.as_str());

            let command = match parse_command(&line) {
                Ok(command) => command,
                Err(e) => {
                    println!("{}", e.to_string().red());
                    continue;
                }
            };

            match command {
                ReplCommand::Display { target, text } => session.display(target, text),
                ReplCommand::Button { group, button, level } => session.button(group, button, level),
                ReplCommand::Echo(value) => session.echo(value),
                ReplCommand::Send(pair) => session.send_exchange(pair),
                ReplCommand::Status => match runtime.block_on(session.state()) {
                    Some(snapshot) => println!(
                        "{:?} (tick {}, epoch {}, identified {})",
                        snapshot.state,
                        snapshot.tick,
                        snapshot.session.epoch,
                        snapshot.session.identified
                    ),
                    None => {
                        println!("{}", "Session has stopped".yellow());
                        break;
                    }
                },
                ReplCommand::Help => println!("{}", HELP),
                ReplCommand::Quit => break,
            }
        }

        session.shutdown();
        Ok(())
    })
    .await
    .context("Console thread panicked")?
}
