//! 人工反馈闸门
//!
//! 编排器在两处征求意见：计划生成之后、合格结果产出之后；任务分解 Agent 在分解之后。
//! 通道只需回答「继续」或「给出反馈文本」。FeedbackGate 按请求方记录所有反馈，
//! 供后续提示词引用。

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

/// 反馈通道的回答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackResponse {
    Continue,
    Feedback(String),
}

/// 反馈通道：request(proposal_text, requester_name)
#[async_trait]
pub trait FeedbackChannel: Send + Sync {
    async fn request(&self, proposal: &str, requester: &str) -> FeedbackResponse;
}

/// 总是继续（无人值守）
pub struct AutoApprove;

#[async_trait]
impl FeedbackChannel for AutoApprove {
    async fn request(&self, _proposal: &str, _requester: &str) -> FeedbackResponse {
        FeedbackResponse::Continue
    }
}

/// 控制台交互：空行表示继续；超时或读取失败视为继续
pub struct StdinFeedback {
    timeout: Duration,
}

impl StdinFeedback {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl FeedbackChannel for StdinFeedback {
    async fn request(&self, proposal: &str, requester: &str) -> FeedbackResponse {
        println!("\n[{}] review requested:\n{}", requester, proposal);
        print!("Your feedback (Enter to continue): ");
        let _ = io::stdout().flush();

        let read = tokio::time::timeout(
            self.timeout,
            tokio::task::spawn_blocking(|| {
                let mut input = String::new();
                io::stdin().read_line(&mut input).ok().map(|_| input)
            }),
        )
        .await;

        match read {
            Ok(Ok(Some(input))) if !input.trim().is_empty() => {
                FeedbackResponse::Feedback(input.trim().to_string())
            }
            Ok(Ok(Some(_))) => FeedbackResponse::Continue,
            _ => {
                tracing::warn!(requester = %requester, "no feedback read, continuing");
                FeedbackResponse::Continue
            }
        }
    }
}

/// 预置回答（测试用）；队列耗尽后一律继续
#[derive(Default)]
pub struct ScriptedFeedback {
    replies: Mutex<VecDeque<FeedbackResponse>>,
    requests: Mutex<Vec<(String, String)>>,
}

impl ScriptedFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, reply: FeedbackResponse) -> Self {
        if let Ok(mut r) = self.replies.lock() {
            r.push_back(reply);
        }
        self
    }

    /// 收到过的请求：(requester, proposal)
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FeedbackChannel for ScriptedFeedback {
    async fn request(&self, proposal: &str, requester: &str) -> FeedbackResponse {
        if let Ok(mut r) = self.requests.lock() {
            r.push((requester.to_string(), proposal.to_string()));
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or(FeedbackResponse::Continue)
    }
}

/// 反馈闸门：转发到通道，并按请求方记下反馈文本
pub struct FeedbackGate {
    channel: Arc<dyn FeedbackChannel>,
    log: Mutex<HashMap<String, Vec<String>>>,
}

impl FeedbackGate {
    pub fn new(channel: Arc<dyn FeedbackChannel>) -> Self {
        Self {
            channel,
            log: Mutex::new(HashMap::new()),
        }
    }

    pub async fn request(&self, proposal: &str, requester: &str) -> FeedbackResponse {
        match self.channel.request(proposal, requester).await {
            FeedbackResponse::Feedback(text) if !text.trim().is_empty() => {
                let text = text.trim().to_string();
                if let Ok(mut log) = self.log.lock() {
                    log.entry(requester.to_string()).or_default().push(text.clone());
                }
                tracing::info!(requester = %requester, feedback = %text, "human feedback received");
                FeedbackResponse::Feedback(text)
            }
            _ => FeedbackResponse::Continue,
        }
    }

    /// 某个请求方收到过的全部反馈（按时间顺序）
    pub fn feedbacks_for(&self, requester: &str) -> Vec<String> {
        self.log
            .lock()
            .ok()
            .and_then(|log| log.get(requester).cloned())
            .unwrap_or_default()
    }
}
