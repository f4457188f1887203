//! 증분 덤퍼 상태 머신
//!
//! 연결 → 인증 → 구독 → 스트리밍 순서로 진행하고, 일시적 에러는 지수 백오프로 재연결합니다.
//! 연결 단계는 [`ReplicationConnector`] / [`ReplicationSession`] / [`ReplicationStream`],
//! 이벤트 해석은 [`StreamDecoder`] 뒤에 있어 MySQL / PostgreSQL이 같은 루프를 공유합니다.

use crate::channel::MemoryChannel;
use crate::connection::ConnectionConfig;
use crate::dialect::DatabaseType;
use crate::error::{CdcError, Result};
use crate::position::{ensure_not_behind, IngestPosition};
use crate::record::{ChangeRecord, TableMapping};
use crate::wal::DecodingPlugin;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 서버 연결을 여는 쪽
#[async_trait]
pub trait ReplicationConnector: Send + Sync {
    type Session: ReplicationSession;

    async fn connect(&self) -> Result<Self::Session>;
}

/// 연결은 됐지만 아직 스트리밍 전인 세션
#[async_trait]
pub trait ReplicationSession: Send {
    type Stream: ReplicationStream;

    async fn authenticate(&mut self) -> Result<()>;

    /// `resume` 위치부터 변경 스트림 구독
    async fn subscribe(self, resume: &IngestPosition) -> Result<Self::Stream>;
}

#[async_trait]
pub trait ReplicationStream: Send {
    /// 다음 프레임. `None`은 서버가 스트림을 끝냈다는 뜻
    async fn next_frame(&mut self) -> Result<Option<Bytes>>;

    /// 수신 / 소비 완료 위치 보고. MySQL처럼 보고가 없는 프로토콜은 기본 구현 사용
    async fn send_feedback(
        &mut self,
        _received: &IngestPosition,
        _acknowledged: Option<&IngestPosition>,
    ) -> Result<()> {
        Ok(())
    }
}

/// 덤퍼가 처리하는 이벤트 단위
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Record(ChangeRecord),
    /// 서버 heartbeat / keepalive. 트랜잭션 밖일 때만 위치를 가짐
    Heartbeat {
        position: Option<IngestPosition>,
        reply_requested: bool,
    },
    /// 레코드 없이 추적 위치만 전진
    Progress(IngestPosition),
}

/// 프레임을 이벤트로 해석하는 방언별 디코더
///
/// 테이블 맵 / relation 캐시는 디코더가 소유하며 한 덤퍼 안에서만 쓰입니다.
#[async_trait]
pub trait StreamDecoder: Send {
    /// 새 세션 시작 전 상태 초기화
    fn reset(&mut self, resume: &IngestPosition) -> Result<()>;

    async fn decode(&mut self, frame: Bytes) -> Result<Vec<StreamEvent>>;
}

/// 덤퍼 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumperState {
    Idle,
    Connecting,
    Authenticating,
    Subscribing,
    Streaming,
    Reconnecting,
    Stopped,
    Failed,
}

impl DumperState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DumperState::Stopped | DumperState::Failed)
    }
}

impl fmt::Display for DumperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DumperState::Idle => "IDLE",
            DumperState::Connecting => "CONNECTING",
            DumperState::Authenticating => "AUTHENTICATING",
            DumperState::Subscribing => "SUBSCRIBING",
            DumperState::Streaming => "STREAMING",
            DumperState::Reconnecting => "RECONNECTING",
            DumperState::Stopped => "STOPPED",
            DumperState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// 재연결 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 연속 실패 허용 횟수
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `attempt`번째 실패 뒤 대기 시간 (1부터 시작)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// 덤퍼 실행에 필요한 설정
#[derive(Debug, Clone)]
pub struct DumperContext {
    pub job_id: String,
    pub database_type: DatabaseType,
    pub connection: ConnectionConfig,
    /// PostgreSQL 스키마 (MySQL은 이벤트의 데이터베이스명을 사용)
    pub schema: Option<String>,
    pub table_mapping: TableMapping,
    pub ddl_enabled: bool,
    pub retry: RetryPolicy,
    /// 프레임 대기 시간. 넘기면 상태 보고만 하고 계속 대기
    pub poll_timeout: Duration,
    pub status_interval: Duration,
    pub heartbeat_interval: Duration,
    pub decoding_plugin: DecodingPlugin,
    pub publication: String,
    /// MySQL GTID 모드가 켜져 있으면 GTID 위치 사용
    pub prefer_gtid: bool,
    pub channel_capacity: usize,
}

impl Default for DumperContext {
    fn default() -> Self {
        DumperContext {
            job_id: "job".to_string(),
            database_type: DatabaseType::MySql,
            connection: ConnectionConfig::default(),
            schema: None,
            table_mapping: TableMapping::new(),
            ddl_enabled: false,
            retry: RetryPolicy::default(),
            poll_timeout: Duration::from_secs(1),
            status_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            decoding_plugin: DecodingPlugin::PgOutput,
            publication: "pipeline_publication".to_string(),
            prefer_gtid: false,
            channel_capacity: 10_000,
        }
    }
}

struct ControlShared {
    state: RwLock<DumperState>,
    position: RwLock<IngestPosition>,
    acknowledged: RwLock<Option<IngestPosition>>,
    cancel: CancellationToken,
}

/// 실행 중인 덤퍼 제어 핸들
#[derive(Clone)]
pub struct DumperControl {
    shared: Arc<ControlShared>,
}

impl DumperControl {
    fn new(position: IngestPosition) -> Self {
        DumperControl {
            shared: Arc::new(ControlShared {
                state: RwLock::new(DumperState::Idle),
                position: RwLock::new(position),
                acknowledged: RwLock::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// 정지 요청. 진행 중인 읽기 / push / 백오프 대기가 즉시 깨어남
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn state(&self) -> DumperState {
        *self.shared.state.read()
    }

    /// 재시작 시 구독할 위치
    pub fn position(&self) -> IngestPosition {
        self.shared.position.read().clone()
    }

    /// 소비자가 확인한 가장 뒤 위치
    pub fn acknowledged(&self) -> Option<IngestPosition> {
        self.shared.acknowledged.read().clone()
    }

    /// 확인 위치 갱신 (뒤로 가지 않음)
    pub fn acknowledge(&self, position: IngestPosition) {
        let mut acknowledged = self.shared.acknowledged.write();
        *acknowledged = Some(match acknowledged.take() {
            Some(previous) => previous.max(position),
            None => position,
        });
    }

    fn set_state(&self, state: DumperState) {
        let mut current = self.shared.state.write();
        if *current != state {
            debug!("Dumper state {} -> {}", *current, state);
            *current = state;
        }
    }

    fn advance(&self, position: &IngestPosition) {
        let mut current = self.shared.position.write();
        if current.is_initial() {
            *current = position.clone();
        } else {
            *current = current.clone().max(position.clone());
        }
    }

    fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.shared.cancel.cancelled()
    }
}

impl fmt::Debug for DumperControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumperControl")
            .field("state", &self.state())
            .field("position", &self.position())
            .field("acknowledged", &self.acknowledged())
            .finish()
    }
}

enum Flow {
    Continue,
    Stop,
}

enum Polled {
    Cancelled,
    Idle,
    Frame(Result<Option<Bytes>>),
}

/// 증분 덤퍼
pub struct IncrementalDumper<C: ReplicationConnector, D: StreamDecoder> {
    connector: C,
    decoder: D,
    channel: Arc<MemoryChannel>,
    retry: RetryPolicy,
    poll_timeout: Duration,
    status_interval: Duration,
    control: DumperControl,
    last_emitted: Option<IngestPosition>,
}

impl<C: ReplicationConnector, D: StreamDecoder> IncrementalDumper<C, D> {
    pub fn new(
        connector: C,
        decoder: D,
        context: &DumperContext,
        position: IngestPosition,
        channel: Arc<MemoryChannel>,
    ) -> Self {
        let control = DumperControl::new(position);
        let ack_control = control.clone();
        channel.set_ack_callback(move |records: &[ChangeRecord]| {
            if let Some(highest) = records
                .iter()
                .map(|r| r.position.clone())
                .reduce(IngestPosition::max)
            {
                ack_control.acknowledge(highest);
            }
        });

        IncrementalDumper {
            connector,
            decoder,
            channel,
            retry: context.retry,
            poll_timeout: context.poll_timeout,
            status_interval: context.status_interval,
            control,
            last_emitted: None,
        }
    }

    pub fn control(&self) -> DumperControl {
        self.control.clone()
    }

    /// 정지 요청 또는 복구 불가 에러까지 실행
    pub async fn start(mut self) -> Result<()> {
        let mut failures: u32 = 0;
        info!("Starting incremental dumper at {}", self.control.position());

        loop {
            if self.control.is_stop_requested() {
                return self.finish_stopped();
            }

            let mut reached_streaming = false;
            let error = match self.run_session(&mut reached_streaming).await {
                Ok(()) => return self.finish_stopped(),
                Err(e) => e,
            };

            if !error.is_retryable() {
                error!("Dumper failed: {}", error);
                self.control.set_state(DumperState::Failed);
                return Err(error);
            }

            if reached_streaming {
                failures = 0;
            }
            failures += 1;
            if failures >= self.retry.max_attempts {
                error!("Giving up after {} consecutive failures: {}", failures, error);
                self.control.set_state(DumperState::Failed);
                return Err(CdcError::RetryExhausted {
                    attempts: failures,
                    last_error: error.to_string(),
                });
            }

            let backoff = self.retry.backoff(failures);
            warn!(
                "Replication session failed (attempt {}/{}): {}; reconnecting in {:?}",
                failures, self.retry.max_attempts, error, backoff
            );
            self.control.set_state(DumperState::Reconnecting);
            tokio::select! {
                biased;
                _ = self.control.cancelled() => return self.finish_stopped(),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    fn finish_stopped(&self) -> Result<()> {
        info!("Dumper stopped at {}", self.control.position());
        self.control.set_state(DumperState::Stopped);
        Ok(())
    }

    /// 연결 하나의 수명. `Ok`는 정지 요청 또는 채널 닫힘
    async fn run_session(&mut self, reached_streaming: &mut bool) -> Result<()> {
        let control = self.control.clone();

        control.set_state(DumperState::Connecting);
        let mut session = tokio::select! {
            biased;
            _ = control.cancelled() => return Ok(()),
            session = self.connector.connect() => session?,
        };

        control.set_state(DumperState::Authenticating);
        tokio::select! {
            biased;
            _ = control.cancelled() => return Ok(()),
            result = session.authenticate() => result?,
        }

        control.set_state(DumperState::Subscribing);
        let resume = control.position();
        self.decoder.reset(&resume)?;
        let mut stream = tokio::select! {
            biased;
            _ = control.cancelled() => return Ok(()),
            stream = session.subscribe(&resume) => stream?,
        };

        control.set_state(DumperState::Streaming);
        *reached_streaming = true;
        info!("Streaming changes from {}", resume);

        let mut last_status = Instant::now();
        loop {
            let polled = tokio::select! {
                biased;
                _ = control.cancelled() => Polled::Cancelled,
                frame = tokio::time::timeout(self.poll_timeout, stream.next_frame()) => match frame {
                    Ok(frame) => Polled::Frame(frame),
                    Err(_) => Polled::Idle,
                },
            };

            match polled {
                Polled::Cancelled => return Ok(()),
                Polled::Idle => {
                    self.send_status(&mut stream).await?;
                    last_status = Instant::now();
                    continue;
                }
                Polled::Frame(Err(e)) => return Err(e),
                Polled::Frame(Ok(None)) => {
                    return Err(CdcError::ConnectionError(
                        "replication stream closed by server".to_string(),
                    ))
                }
                Polled::Frame(Ok(Some(frame))) => {
                    for event in self.decoder.decode(frame).await? {
                        if let Flow::Stop = self.handle_event(event, &mut stream).await? {
                            return Ok(());
                        }
                    }
                }
            }

            if last_status.elapsed() >= self.status_interval {
                self.send_status(&mut stream).await?;
                last_status = Instant::now();
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: StreamEvent,
        stream: &mut <C::Session as ReplicationSession>::Stream,
    ) -> Result<Flow> {
        match event {
            StreamEvent::Record(record) => {
                if let Some(previous) = &self.last_emitted {
                    ensure_not_behind(previous, &record.position)?;
                }
                let tracked = self.control.position();
                if !tracked.is_initial() {
                    ensure_not_behind(&tracked, &record.position)?;
                }

                let position = record.position.clone();
                let control = self.control.clone();
                let pushed = tokio::select! {
                    biased;
                    _ = control.cancelled() => return Ok(Flow::Stop),
                    pushed = self.channel.push(record) => pushed,
                };
                match pushed {
                    Ok(()) => {}
                    Err(CdcError::ChannelClosed) => {
                        info!("Channel closed, stopping dumper");
                        return Ok(Flow::Stop);
                    }
                    Err(e) => return Err(e),
                }
                self.control.advance(&position);
                self.last_emitted = Some(position);
            }
            StreamEvent::Heartbeat {
                position,
                reply_requested,
            } => {
                if let Some(position) = position {
                    self.control.advance(&position);
                }
                if reply_requested {
                    self.send_status(stream).await?;
                }
            }
            StreamEvent::Progress(position) => self.control.advance(&position),
        }
        Ok(Flow::Continue)
    }

    async fn send_status(&self, stream: &mut <C::Session as ReplicationSession>::Stream) -> Result<()> {
        let received = self.control.position();
        let acknowledged = self.control.acknowledged();
        stream.send_feedback(&received, acknowledged.as_ref()).await
    }
}
