//! Turn event collection.
//!
//! One prompt cycle: subscribe, send, wait for idle, then drain the event
//! stream. Tool events deduplicate on `tool_call_id`; assistant message ends
//! accumulate into the final assistant text. The subscription is released on
//! every exit path because the receiver is dropped with the stack frame.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::TryRecvError;
use tracing::warn;

use crate::error::RuntimeError;
use crate::session::{MessageRole, Session, SessionEvent};

/// One deduplicated tool execution observed during a prompt cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolTurnEvent {
    /// Unique id of the call.
    pub tool_call_id: String,
    /// Tool name.
    pub tool_name: String,
    /// Short result summary.
    pub summary: String,
}

/// Everything a prompt cycle produced.
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    /// Tool events in observation order.
    pub tool_events: Vec<ToolTurnEvent>,
    /// Concatenated assistant text; empty when the model said nothing.
    pub assistant_text: String,
}

/// Drive one prompt through a session and collect its outputs.
///
/// # Errors
///
/// Propagates the send failure; events observed before the failure are
/// discarded with the subscription.
pub async fn run_prompt(session: &Arc<dyn Session>, prompt: &str) -> Result<TurnOutput, RuntimeError> {
    let mut receiver = session.subscribe_events();
    session.send_user_message(prompt).await?;
    session.wait_for_idle().await;

    let mut output = TurnOutput::default();
    let mut seen_tool_calls: HashSet<String> = HashSet::new();
    let mut assistant_chunks: Vec<String> = Vec::new();

    loop {
        match receiver.try_recv() {
            Ok(SessionEvent::ToolExecutionEnd {
                tool_call_id,
                tool_name,
                summary,
            }) => {
                if seen_tool_calls.insert(tool_call_id.clone()) {
                    output.tool_events.push(ToolTurnEvent {
                        tool_call_id,
                        tool_name,
                        summary,
                    });
                }
            },
            Ok(SessionEvent::MessageEnd { role, text }) => {
                if role == MessageRole::Assistant && !text.trim().is_empty() {
                    assistant_chunks.push(text);
                }
            },
            Err(TryRecvError::Lagged(count)) => {
                warn!(skipped = count, "session event stream lagged");
            },
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    output.assistant_text = assistant_chunks.join("\n\n");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    /// A session that replays scripted events when prompted.
    struct ScriptedSession {
        events: broadcast::Sender<SessionEvent>,
        script: Vec<SessionEvent>,
        fail_send: bool,
    }

    #[async_trait]
    impl Session for ScriptedSession {
        fn id(&self) -> String {
            "scripted".to_string()
        }

        async fn send_user_message(&self, _text: &str) -> Result<(), RuntimeError> {
            if self.fail_send {
                return Err(RuntimeError::Session("send failed".to_string()));
            }
            for event in &self.script {
                let _ = self.events.send(event.clone());
            }
            Ok(())
        }

        async fn wait_for_idle(&self) {}

        fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
            self.events.subscribe()
        }

        async fn dispose(&self) {}
    }

    fn session_with(script: Vec<SessionEvent>) -> Arc<dyn Session> {
        let (events, _) = broadcast::channel(64);
        Arc::new(ScriptedSession {
            events,
            script,
            fail_send: false,
        })
    }

    fn tool(id: &str) -> SessionEvent {
        SessionEvent::ToolExecutionEnd {
            tool_call_id: id.to_string(),
            tool_name: "shell".to_string(),
            summary: format!("ran {id}"),
        }
    }

    fn assistant(text: &str) -> SessionEvent {
        SessionEvent::MessageEnd {
            role: MessageRole::Assistant,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn collects_tools_then_assistant() {
        let session = session_with(vec![tool("c1"), tool("c2"), assistant("done")]);
        let output = run_prompt(&session, "go").await.unwrap();
        assert_eq!(output.tool_events.len(), 2);
        assert_eq!(output.assistant_text, "done");
    }

    #[tokio::test]
    async fn duplicate_tool_calls_are_collapsed() {
        let session = session_with(vec![tool("c1"), tool("c1"), tool("c1")]);
        let output = run_prompt(&session, "go").await.unwrap();
        assert_eq!(output.tool_events.len(), 1);
    }

    #[tokio::test]
    async fn non_assistant_messages_are_ignored() {
        let session = session_with(vec![
            SessionEvent::MessageEnd {
                role: MessageRole::User,
                text: "echo".to_string(),
            },
            SessionEvent::MessageEnd {
                role: MessageRole::Tool,
                text: "tool output".to_string(),
            },
        ]);
        let output = run_prompt(&session, "go").await.unwrap();
        assert!(output.assistant_text.is_empty());
    }

    #[tokio::test]
    async fn whitespace_only_assistant_text_is_empty() {
        let session = session_with(vec![assistant("   \n  ")]);
        let output = run_prompt(&session, "go").await.unwrap();
        assert!(output.assistant_text.is_empty());
    }

    #[tokio::test]
    async fn multiple_assistant_messages_concatenate() {
        let session = session_with(vec![assistant("first"), assistant("second")]);
        let output = run_prompt(&session, "go").await.unwrap();
        assert_eq!(output.assistant_text, "first\n\nsecond");
    }

    #[tokio::test]
    async fn send_failure_propagates() {
        let (events, _) = broadcast::channel(4);
        let session: Arc<dyn Session> = Arc::new(ScriptedSession {
            events,
            script: vec![],
            fail_send: true,
        });
        assert!(run_prompt(&session, "go").await.is_err());
    }
}
