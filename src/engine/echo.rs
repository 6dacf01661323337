//! 回显引擎：网关二进制的默认引擎
//!
//! 先产出任务本身（source = user），再回显；任务以 `?` 结尾时请求用户确认。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ConversationEngine, EngineError, EngineFactory, EngineState, EventStream, InputProvider};
use crate::gateway::Envelope;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct EchoState {
    turns: u64,
}

#[derive(Default)]
pub struct EchoEngine {
    state: EchoState,
}

#[async_trait]
impl ConversationEngine for EchoEngine {
    fn run(&mut self, task: String, input: Arc<dyn InputProvider>) -> EventStream<'_> {
        Box::pin(async_stream::stream! {
            self.state.turns += 1;
            let turn = self.state.turns;
            yield Ok(Envelope::text("user", task.clone()));
            yield Ok(Envelope::text("echo_agent", format!("[{turn}] {task}")));
            if task.trim_end().ends_with('?') {
                let prompt = "Should I answer that? (yes/no)";
                yield Ok(Envelope::input_request("user_proxy", prompt));
                match input.provide(prompt).await {
                    Ok(reply) => {
                        yield Ok(Envelope::text("user_proxy", reply.clone()));
                        yield Ok(Envelope::text("echo_agent", format!("You said: {reply}")));
                    }
                    Err(e) => {
                        yield Err(EngineError::from(e));
                        return;
                    }
                }
            }
            yield Ok(Envelope::task_result("stop_reason: echo complete"));
        })
    }

    async fn save_state(&self) -> Result<EngineState, EngineError> {
        EngineState::from_value(&self.state)
    }

    async fn load_state(&mut self, state: &EngineState) -> Result<(), EngineError> {
        self.state = state.to_value()?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoEngineFactory;

impl EngineFactory for EchoEngineFactory {
    fn create(&self, _session_id: &str) -> Box<dyn ConversationEngine> {
        Box::new(EchoEngine::default())
    }
}
