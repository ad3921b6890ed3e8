//! Wire format of the control protocol

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::ControlError;
use crate::tracker::Changes;

/// Longest accepted command line
const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Click {
        selector: String,
    },
    PutAttr {
        selector: String,
        name: String,
        value: String,
    },
}

impl Command {
    /// Read one command: the verb line plus the lines it needs.
    ///
    /// Does not wait for the peer to close its side.
    pub async fn read<R>(reader: &mut R) -> Result<Command, ControlError>
    where
        R: AsyncBufRead + Unpin,
    {
        let verb = read_line(reader, "command").await?;
        match verb.trim() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "click" => Ok(Command::Click {
                selector: read_selector(reader).await?,
            }),
            "attr" => {
                let selector = read_selector(reader).await?;
                let name = read_line(reader, "attribute name").await?.trim().to_string();
                if name.is_empty() {
                    return Err(ControlError::Protocol("empty attribute name".to_string()));
                }
                let value = read_line(reader, "attribute value").await?;
                Ok(Command::PutAttr {
                    selector,
                    name,
                    value,
                })
            }
            other => Err(ControlError::Protocol(format!("unknown command {:?}", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Click { .. } => "click",
            Command::PutAttr { .. } => "attr",
        }
    }
}

async fn read_line<R>(reader: &mut R, expected: &str) -> Result<String, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Err(ControlError::Protocol(format!(
            "unexpected end of input, expected {}",
            expected
        )));
    }
    if line.len() > MAX_LINE {
        return Err(ControlError::Protocol(format!("{} line too long", expected)));
    }

    let trimmed = line.trim_end_matches(['\n', '\r']).len();
    line.truncate(trimmed);
    Ok(line)
}

async fn read_selector<R>(reader: &mut R) -> Result<String, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let selector = read_line(reader, "selector").await?.trim().to_string();
    if selector.is_empty() {
        return Err(ControlError::Protocol("empty selector".to_string()));
    }
    Ok(selector)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `click` carries whether an action fired
    Changed { html: String, click: Option<bool> },
    Unchanged { click: Option<bool> },
    Ok,
    Error { kind: String, detail: String },
}

impl Response {
    pub fn from_changes(changes: Changes, click: Option<bool>) -> Self {
        if changes.changed {
            Response::Changed {
                html: changes.html,
                click,
            }
        } else {
            Response::Unchanged { click }
        }
    }

    pub fn error(err: &ControlError) -> Self {
        Response::Error {
            kind: err.kind().to_string(),
            detail: err.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Response::Changed { html, click } => format!("changed{}\n{}", click_suffix(*click), html),
            Response::Unchanged { click } => format!("unchanged{}\n", click_suffix(*click)),
            Response::Ok => "ok\n".to_string(),
            Response::Error { kind, detail } => {
                let detail: String = detail
                    .chars()
                    .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
                    .collect();
                format!("error {}: {}\n", kind, detail)
            }
        }
    }

    pub async fn write<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(self.encode().as_bytes()).await?;
        writer.flush().await
    }
}

fn click_suffix(click: Option<bool>) -> &'static str {
    match click {
        Some(true) => " fired",
        Some(false) => " noaction",
        None => "",
    }
}
