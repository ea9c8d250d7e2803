use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use std::str::FromStr;

/// Operating mode requested by the operator. Only `Auto` changes nothing;
/// the others are accepted and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Auto,
    Hybrid,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorPriority {
    Green,
    Red,
    Blue,
    Yellow,
}

pub fn value_name<T: ValueEnum>(value: &T) -> String {
    value
        .to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start {
        mode: Option<Mode>,
        priority: Option<ColorPriority>,
    },
    Stop,
    Reset,
    Status,
    Lower([u8; 3]),
    Upper([u8; 3]),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  start [auto|hybrid|manual] [green|red|blue|yellow]
  stop
  reset
  status
  lower H S V      set the ally band lower bound
  upper H S V      set the ally band upper bound
  help
  quit";

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            bail!("empty command");
        };
        let args: Vec<&str> = words.collect();
        let command = match verb.to_ascii_lowercase().as_str() {
            "start" => {
                if args.len() > 2 {
                    bail!("start takes at most a mode and a priority");
                }
                Command::Start {
                    mode: args.first().map(|s| parse_enum(s)).transpose()?,
                    priority: args.get(1).map(|s| parse_enum(s)).transpose()?,
                }
            }
            "stop" => Command::Stop,
            "reset" => Command::Reset,
            "status" => Command::Status,
            "lower" => Command::Lower(parse_triple(&args)?),
            "upper" => Command::Upper(parse_triple(&args)?),
            "help" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            other => bail!("unknown command '{}'", other),
        };
        Ok(command)
    }
}

fn parse_enum<T: ValueEnum>(word: &str) -> Result<T> {
    T::from_str(word, true).map_err(|err| anyhow!(err))
}

fn parse_triple(args: &[&str]) -> Result<[u8; 3]> {
    if args.len() != 3 {
        bail!("expected three values H S V, got {}", args.len());
    }
    let mut values = [0u8; 3];
    for (slot, word) in values.iter_mut().zip(args) {
        *slot = word
            .parse()
            .with_context(|| format!("'{}' is not a value in 0..=255", word))?;
    }
    Ok(values)
}
