//! 덤퍼와 소비자 사이의 bounded 채널
//!
//! 가득 차면 push가 블록되어 덤퍼에 back-pressure가 걸립니다.
//! close 이후 fetch는 남은 레코드를 비우고 나면 즉시 빈 결과를 돌려줍니다.

use crate::error::{CdcError, Result};
use crate::record::ChangeRecord;
use parking_lot::RwLock;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type AckCallback = Box<dyn Fn(&[ChangeRecord]) + Send + Sync>;

pub struct MemoryChannel {
    sender: mpsc::Sender<ChangeRecord>,
    receiver: Mutex<mpsc::Receiver<ChangeRecord>>,
    closed: CancellationToken,
    ack_callback: RwLock<Option<AckCallback>>,
    capacity: usize,
}

impl MemoryChannel {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        MemoryChannel {
            sender,
            receiver: Mutex::new(receiver),
            closed: CancellationToken::new(),
            ack_callback: RwLock::new(None),
            capacity,
        }
    }

    /// 레코드 추가. 가득 차 있으면 자리가 날 때까지 대기
    pub async fn push(&self, record: ChangeRecord) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(CdcError::ChannelClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(CdcError::ChannelClosed),
            sent = self.sender.send(record) => sent.map_err(|_| CdcError::ChannelClosed),
        }
    }

    /// 최대 `max_count`개 또는 timeout까지 모은 레코드
    pub async fn fetch(&self, max_count: usize, timeout: Duration) -> Vec<ChangeRecord> {
        let mut receiver = self.receiver.lock().await;
        let deadline = Instant::now() + timeout;
        let mut records = Vec::with_capacity(max_count.min(self.capacity));

        while records.len() < max_count {
            match receiver.try_recv() {
                Ok(record) => {
                    records.push(record);
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            if self.closed.is_cancelled() {
                break;
            }
            tokio::select! {
                received = receiver.recv() => match received {
                    Some(record) => records.push(record),
                    None => break,
                },
                // 닫히면 루프를 한 번 더 돌아 남은 레코드를 비움
                _ = self.closed.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        records
    }

    /// 소비 완료 통지
    pub fn ack(&self, records: &[ChangeRecord]) {
        if records.is_empty() {
            return;
        }
        if let Some(callback) = self.ack_callback.read().as_ref() {
            callback(records);
        }
    }

    pub fn set_ack_callback<F>(&self, callback: F)
    where
        F: Fn(&[ChangeRecord]) + Send + Sync + 'static,
    {
        *self.ack_callback.write() = Some(Box::new(callback));
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 버퍼에 쌓인 레코드 수
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
