use super::{
    AckHandler, OutgoingMessage, PubSubTransport, ReceiveSettings, ReceivedMessage,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};

/// 进程内消息总线
///
/// 主题扇出到其全部订阅；未确认的消息计入 `max_outstanding_messages`，
/// nack 后重新排到队首并增加投递次数。
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    state: Mutex<BusState>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicState>,
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Default)]
struct TopicState {
    subscriptions: Vec<String>,
    published: Vec<(String, OutgoingMessage)>,
    failing: bool,
}

struct SubscriptionState {
    queue: VecDeque<Pending>,
    outstanding: HashMap<String, Pending>,
    acked: Vec<String>,
    nacks: usize,
    notify: Arc<Notify>,
}

#[derive(Clone)]
struct Pending {
    id: String,
    message: OutgoingMessage,
    attempt: u32,
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("MemoryBus")
            .field("topics", &state.topics.keys().collect::<Vec<_>>())
            .field("subscriptions", &state.subscriptions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settle(&self, subscription: &str, message_id: &str, ack: bool) {
        let mut state = self.lock();
        let Some(sub) = state.subscriptions.get_mut(subscription) else {
            return;
        };
        let Some(mut pending) = sub.outstanding.remove(message_id) else {
            return;
        };
        if ack {
            sub.acked.push(pending.id);
        } else {
            sub.nacks += 1;
            pending.attempt += 1;
            sub.queue.push_front(pending);
        }
        sub.notify.notify_waiters();
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &str) {
        self.inner.lock().topics.entry(topic.to_owned()).or_default();
    }

    /// 创建订阅；主题不存在时一并创建
    pub fn create_subscription(&self, subscription: &str, topic: &str) {
        let mut state = self.inner.lock();
        let topic_state = state.topics.entry(topic.to_owned()).or_default();
        if !topic_state.subscriptions.iter().any(|s| s == subscription) {
            topic_state.subscriptions.push(subscription.to_owned());
        }
        state
            .subscriptions
            .entry(subscription.to_owned())
            .or_insert_with(|| SubscriptionState {
                queue: VecDeque::new(),
                outstanding: HashMap::new(),
                acked: Vec::new(),
                nacks: 0,
                notify: Arc::new(Notify::new()),
            });
    }

    /// 之后发往该主题的消息全部失败
    pub fn set_failing(&self, topic: &str, failing: bool) {
        self.inner
            .lock()
            .topics
            .entry(topic.to_owned())
            .or_default()
            .failing = failing;
    }

    /// 已发布到主题的消息（含服务端分配的ID）
    pub fn published(&self, topic: &str) -> Vec<(String, OutgoingMessage)> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|t| t.published.clone())
            .unwrap_or_default()
    }

    pub fn acked(&self, subscription: &str) -> Vec<String> {
        self.inner
            .lock()
            .subscriptions
            .get(subscription)
            .map(|s| s.acked.clone())
            .unwrap_or_default()
    }

    pub fn nack_count(&self, subscription: &str) -> usize {
        self.inner
            .lock()
            .subscriptions
            .get(subscription)
            .map_or(0, |s| s.nacks)
    }

    pub fn outstanding(&self, subscription: &str) -> usize {
        self.inner
            .lock()
            .subscriptions
            .get(subscription)
            .map_or(0, |s| s.outstanding.len())
    }

    /// 尚未投递的消息数
    pub fn backlog(&self, subscription: &str) -> usize {
        self.inner
            .lock()
            .subscriptions
            .get(subscription)
            .map_or(0, |s| s.queue.len())
    }
}

struct MemoryAcker {
    bus: Arc<BusInner>,
    subscription: String,
}

impl AckHandler for MemoryAcker {
    fn ack(&self, message_id: &str) {
        self.bus.settle(&self.subscription, message_id, true);
    }

    fn nack(&self, message_id: &str) {
        self.bus.settle(&self.subscription, message_id, false);
    }
}

#[async_trait]
impl PubSubTransport for MemoryBus {
    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<String> {
        let mut state = self.inner.lock();
        let topic_state = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| Error::Publish(format!("topic not found: {topic}")))?;
        if topic_state.failing {
            return Err(Error::Publish(format!("topic unavailable: {topic}")));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        topic_state.published.push((id.clone(), message.clone()));
        let subscriptions = topic_state.subscriptions.clone();
        for name in subscriptions {
            if let Some(sub) = state.subscriptions.get_mut(&name) {
                sub.queue.push_back(Pending {
                    id: id.clone(),
                    message: message.clone(),
                    attempt: 1,
                });
                sub.notify.notify_waiters();
            }
        }
        Ok(id)
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool> {
        Ok(self.inner.lock().subscriptions.contains_key(subscription))
    }

    async fn receive(
        &self,
        subscription: &str,
        settings: &ReceiveSettings,
    ) -> Result<mpsc::Receiver<ReceivedMessage>> {
        let notify = self
            .inner
            .lock()
            .subscriptions
            .get(subscription)
            .map(|s| s.notify.clone())
            .ok_or_else(|| Error::SubscriptionNotFound(subscription.to_owned()))?;

        let max_outstanding = settings.max_outstanding_messages.max(1);
        let (sender, receiver) = mpsc::channel(max_outstanding);
        let bus = self.inner.clone();
        let acker: Arc<dyn AckHandler> = Arc::new(MemoryAcker {
            bus: bus.clone(),
            subscription: subscription.to_owned(),
        });
        let subscription = subscription.to_owned();

        tokio::spawn(async move {
            loop {
                let notified = notify.notified();
                let next = {
                    let mut state = bus.lock();
                    match state.subscriptions.get_mut(&subscription) {
                        None => return,
                        Some(sub) if sub.outstanding.len() >= max_outstanding => None,
                        Some(sub) => sub.queue.pop_front().inspect(|pending| {
                            sub.outstanding.insert(pending.id.clone(), pending.clone());
                        }),
                    }
                };
                let Some(pending) = next else {
                    tokio::select! {
                        _ = notified => continue,
                        _ = sender.closed() => return,
                    }
                };
                let message = ReceivedMessage::new(
                    pending.id.clone(),
                    subscription.clone(),
                    pending.message.clone(),
                    pending.attempt,
                    acker.clone(),
                );
                if sender.send(message).await.is_err() {
                    // 接收端已关闭，把消息放回队首
                    let mut state = bus.lock();
                    if let Some(sub) = state.subscriptions.get_mut(&subscription) {
                        if let Some(pending) = sub.outstanding.remove(&pending.id) {
                            sub.queue.push_front(pending);
                        }
                    }
                    return;
                }
            }
        });
        Ok(receiver)
    }
}
