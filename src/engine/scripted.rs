//! 脚本化引擎（用于测试与演示，无需模型）
//!
//! 每次 `run` 从共享队列取出下一段脚本并逐步产出事件；队列为空时只产出结束事件。
//! `Ask` 步骤先发出输入请求事件，再通过 InputProvider 等待回复。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ConversationEngine, EngineError, EngineFactory, EngineState, EventStream, InputProvider};
use crate::gateway::Envelope;

/// 脚本步骤
#[derive(Clone, Debug)]
pub enum Step {
    /// 原样产出一个事件
    Emit(Envelope),
    /// 发出输入请求并等待回复
    Ask(String),
    /// 直接调用 provide，不自己发出请求事件
    Await(String),
    /// 只发出输入请求事件，不等待（流随后结束）
    Prompt(String),
    /// 运行失败
    Fail(String),
    Sleep(Duration),
}

/// 引擎快照内容
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptedState {
    pub runs: u64,
    pub tasks: Vec<String>,
    pub replies: Vec<String>,
}

type ScriptQueue = Arc<Mutex<VecDeque<Vec<Step>>>>;

fn pop_script(queue: &ScriptQueue) -> Vec<Step> {
    queue
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .pop_front()
        .unwrap_or_default()
}

pub struct ScriptedEngine {
    scripts: ScriptQueue,
    state: ScriptedState,
    loaded: Arc<Mutex<Vec<EngineState>>>,
}

impl ScriptedEngine {
    /// 单引擎，每个脚本对应一次 run
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            state: ScriptedState::default(),
            loaded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn state(&self) -> &ScriptedState {
        &self.state
    }
}

#[async_trait]
impl ConversationEngine for ScriptedEngine {
    fn run(&mut self, task: String, input: Arc<dyn InputProvider>) -> EventStream<'_> {
        let script = pop_script(&self.scripts);
        Box::pin(async_stream::stream! {
            self.state.runs += 1;
            self.state.tasks.push(task);
            for step in script {
                match step {
                    Step::Emit(env) => yield Ok(env),
                    Step::Ask(prompt) => {
                        yield Ok(Envelope::input_request("user_proxy", prompt.clone()));
                        match input.provide(&prompt).await {
                            Ok(reply) => self.state.replies.push(reply),
                            Err(e) => {
                                yield Err(EngineError::from(e));
                                return;
                            }
                        }
                    }
                    Step::Await(prompt) => match input.provide(&prompt).await {
                        Ok(reply) => self.state.replies.push(reply),
                        Err(e) => {
                            yield Err(EngineError::from(e));
                            return;
                        }
                    },
                    Step::Prompt(prompt) => {
                        yield Ok(Envelope::input_request("user_proxy", prompt));
                    }
                    Step::Fail(reason) => {
                        yield Err(EngineError::Run(reason));
                        return;
                    }
                    Step::Sleep(d) => tokio::time::sleep(d).await,
                }
            }
            yield Ok(Envelope::task_result("stop_reason: script finished"));
        })
    }

    async fn save_state(&self) -> Result<EngineState, EngineError> {
        EngineState::from_value(&self.state)
    }

    async fn load_state(&mut self, state: &EngineState) -> Result<(), EngineError> {
        self.state = state.to_value()?;
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(state.clone());
        Ok(())
    }
}

/// 脚本引擎工厂：所有引擎实例共享同一个脚本队列，按 run 的先后顺序取用
#[derive(Clone, Default)]
pub struct ScriptedEngineFactory {
    scripts: ScriptQueue,
    loaded: Arc<Mutex<Vec<EngineState>>>,
}

impl ScriptedEngineFactory {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            loaded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push_script(&self, script: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(script);
    }

    /// 所有引擎实例装载过的状态（按装载顺序）
    pub fn loaded_states(&self) -> Vec<EngineState> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EngineFactory for ScriptedEngineFactory {
    fn create(&self, _session_id: &str) -> Box<dyn ConversationEngine> {
        Box::new(ScriptedEngine {
            scripts: Arc::clone(&self.scripts),
            state: ScriptedState::default(),
            loaded: Arc::clone(&self.loaded),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InputError;
    use futures_util::StreamExt;

    struct FixedReply(&'static str);

    #[async_trait]
    impl InputProvider for FixedReply {
        async fn provide(&self, _prompt: &str) -> Result<String, InputError> {
            Ok(self.0.to_string())
        }
    }

    struct Gone;

    #[async_trait]
    impl InputProvider for Gone {
        async fn provide(&self, _prompt: &str) -> Result<String, InputError> {
            Err(InputError::Disconnected)
        }
    }

    #[tokio::test]
    async fn test_script_runs_in_order() {
        let mut engine = ScriptedEngine::new(vec![vec![
            Step::Emit(Envelope::text("agent", "one")),
            Step::Ask("more?".to_string()),
            Step::Emit(Envelope::text("agent", "two")),
        ]]);
        let events: Vec<_> = engine
            .run("go".to_string(), Arc::new(FixedReply("yes")))
            .collect()
            .await;
        let kinds: Vec<_> = events
            .into_iter()
            .map(|e| e.unwrap().kind.to_string())
            .collect();
        assert_eq!(
            kinds,
            ["TextMessage", "UserInputRequestedEvent", "TextMessage", "TaskResult"]
        );
        assert_eq!(engine.state().replies, vec!["yes".to_string()]);
        assert_eq!(engine.state().tasks, vec!["go".to_string()]);
    }

    #[tokio::test]
    async fn test_input_failure_ends_stream() {
        let mut engine = ScriptedEngine::new(vec![vec![
            Step::Ask("more?".to_string()),
            Step::Emit(Envelope::text("agent", "never")),
        ]]);
        let events: Vec<_> = engine.run("go".to_string(), Arc::new(Gone)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            Err(EngineError::Input(InputError::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_state_round_trip_through_factory() {
        let factory = ScriptedEngineFactory::new(vec![vec![]]);
        let mut first = factory.create("s1");
        let _ = first
            .run("hello".to_string(), Arc::new(FixedReply("")))
            .collect::<Vec<_>>()
            .await;
        let saved = first.save_state().await.unwrap();

        let mut second = factory.create("s1");
        second.load_state(&saved).await.unwrap();
        assert_eq!(second.save_state().await.unwrap(), saved);
        assert_eq!(factory.loaded_states(), vec![saved]);
    }

    #[tokio::test]
    async fn test_each_run_takes_next_script() {
        let mut engine = ScriptedEngine::new(vec![
            vec![Step::Prompt("more?".to_string())],
            vec![Step::Emit(Envelope::text("agent", "second"))],
        ]);
        let first: Vec<_> = engine.run("a".into(), Arc::new(FixedReply(""))).collect().await;
        assert!(first[0].as_ref().unwrap().is_input_request());
        let second: Vec<_> = engine.run("b".into(), Arc::new(FixedReply(""))).collect().await;
        assert_eq!(second[0].as_ref().unwrap().content, "second");
        let third: Vec<_> = engine.run("c".into(), Arc::new(FixedReply(""))).collect().await;
        assert_eq!(third.len(), 1);
        assert_eq!(engine.state().runs, 3);
    }
}
