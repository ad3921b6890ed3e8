//! Command dispatch against the single active session

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::protocol::{Command, Response};
use super::ControlError;
use crate::bridge::{Fetcher, StyleProvider};
use crate::config::SessionConfig;
use crate::error::ExecError;
use crate::session::{ExecRequest, ExecutionSession};

/// What `start` loads: the page and its scripts, in document order
pub struct StartPlan {
    pub config: SessionConfig,
    pub html: String,
    /// First one runs as the bootstrap
    pub scripts: Vec<String>,
    pub fetcher: Arc<dyn Fetcher>,
    pub styles: Arc<dyn StyleProvider>,
}

pub struct Dispatcher {
    plan: StartPlan,
    session: Mutex<Option<ExecutionSession>>,
}

impl Dispatcher {
    pub fn new(plan: StartPlan) -> Self {
        Self {
            plan,
            session: Mutex::new(None),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn dispatch(&self, command: Command) -> Result<Response, ControlError> {
        tracing::debug!(command = command.name(), "Dispatching");
        match command {
            Command::Start => self.start().await,
            Command::Stop => {
                self.shutdown().await;
                Ok(Response::Ok)
            }
            Command::Click { selector } => {
                let mut slot = self.session.lock().await;
                let session = slot.as_mut().ok_or(ControlError::NoSession)?;
                let outcome = session.click(&selector).await?;
                Ok(Response::from_changes(outcome.changes, Some(outcome.fired)))
            }
            Command::PutAttr {
                selector,
                name,
                value,
            } => {
                let mut slot = self.session.lock().await;
                let session = slot.as_mut().ok_or(ControlError::NoSession)?;
                if session.put_attr(&selector, &name, &value).await? {
                    Ok(Response::Ok)
                } else {
                    Err(ExecError::Runtime {
                        message: format!("no element matches {}", selector),
                        line: None,
                        column: None,
                    }
                    .into())
                }
            }
        }
    }

    /// Stop the active session, if any
    pub async fn shutdown(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            session.stop().await;
        }
    }

    async fn start(&self) -> Result<Response, ControlError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Err(ControlError::SessionActive);
        }

        let mut session = ExecutionSession::new(
            self.plan.config.renewed(),
            self.plan.html.clone(),
            Arc::clone(&self.plan.fetcher),
            Arc::clone(&self.plan.styles),
        );
        session.start().await?;

        match load_page(&mut session, &self.plan.scripts).await {
            Ok(changes) => {
                *slot = Some(session);
                Ok(Response::from_changes(changes, None))
            }
            Err(err) => {
                tracing::error!("Start aborted: {}", err);
                session.stop().await;
                Err(err.into())
            }
        }
    }
}

/// Run the page scripts, close the document and take the first snapshot.
///
/// A failing script is logged and skipped; an interrupted one aborts the load.
async fn load_page(
    session: &mut ExecutionSession,
    scripts: &[String],
) -> Result<crate::tracker::Changes, ExecError> {
    if scripts.is_empty() {
        session.exec(ExecRequest::bootstrap("")).await?;
    }

    for (index, script) in scripts.iter().enumerate() {
        let request = if index == 0 {
            ExecRequest::bootstrap(script.as_str())
        } else {
            ExecRequest::script(script.as_str())
        };
        match session.exec(request).await {
            Ok(_) => {}
            Err(err) if err.is_interrupt() => return Err(err),
            Err(err) => tracing::warn!(script = index, "Page script failed: {}", err),
        }
    }

    match session.close_doc().await {
        Ok(()) => {}
        Err(err) if err.is_interrupt() => return Err(err),
        Err(err) => tracing::warn!("Load handlers failed: {}", err),
    }

    session.track_changes().await
}

/// Serve one connection: read a command, write the response, close
pub async fn handle_client<S>(stream: S, dispatcher: &Dispatcher) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let response = match Command::read(&mut reader).await {
        Ok(command) => {
            let name = command.name();
            dispatcher.dispatch(command).await.unwrap_or_else(|err| {
                tracing::warn!(command = name, kind = err.kind(), "Command failed: {}", err);
                Response::error(&err)
            })
        }
        Err(err) => {
            tracing::warn!("Rejected control request: {}", err);
            Response::error(&err)
        }
    };

    response.write(&mut write_half).await?;
    write_half.shutdown().await?;
    Ok(())
}
