//! Interactive queries on stdin.

use nstopo::Topology;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

const HELP: &str = "\
commands:
  <index>          dump a device in the default namespace
  <ns> <index>     dump a device in namespace <ns>
  *                dump every namespace
  help             this text
  bye              delete all namespaces and exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Bye,
    EndOfInput,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Device { namespace: Option<String>, index: u32 },
    All,
    Help,
    Bye,
}

fn parse(line: &str) -> Result<Option<Command>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let command = match words.as_slice() {
        [] => return Ok(None),
        ["*"] => Command::All,
        ["help"] | ["?"] => Command::Help,
        ["bye"] | ["quit"] | ["exit"] => Command::Bye,
        [index] => Command::Device {
            namespace: None,
            index: parse_index(index)?,
        },
        [namespace, index] => Command::Device {
            namespace: Some(namespace.to_string()),
            index: parse_index(index)?,
        },
        _ => return Err(format!("unrecognized command '{line}' (try help)")),
    };
    Ok(Some(command))
}

fn parse_index(word: &str) -> Result<u32, String> {
    word.parse()
        .map_err(|_| format!("'{word}' is not an interface index (try help)"))
}

/// Answer queries until `bye` or end of input.
pub async fn run(topology: &Topology) -> anyhow::Result<Exit> {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    while let Some(line) = lines.next().await {
        let line = line?;
        match parse(&line) {
            Ok(None) => {}
            Ok(Some(Command::Bye)) => return Ok(Exit::Bye),
            Ok(Some(Command::Help)) => eprintln!("{HELP}"),
            Ok(Some(Command::All)) => print(&topology.dump_all().await)?,
            Ok(Some(Command::Device { namespace, index })) => {
                let namespace = namespace.unwrap_or_else(|| topology.config().default_namespace.clone());
                match topology.dump(&namespace, index).await {
                    Ok(dump) => print(&dump)?,
                    Err(e) => eprintln!("{e}"),
                }
            }
            Err(message) => eprintln!("{message}"),
        }
    }
    Ok(Exit::EndOfInput)
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
