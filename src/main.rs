/// 증분 수집 실행 예제
///
/// 설정은 `CDC_CONFIG`가 가리키는 JSON 파일 또는 `CDC_*` 환경 변수에서 읽습니다.
/// `CDC_POSITION`이 있으면 그 위치부터, 없으면 데이터 소스의 현재 위치부터 수집합니다.
use rust_cdc::channel::MemoryChannel;
use rust_cdc::config::PipelineConfig;
use rust_cdc::dialect::{create_dumper, position_manager};
use rust_cdc::record::Operation;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const FETCH_BATCH: usize = 100;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match env::var("CDC_CONFIG") {
        Ok(path) => PipelineConfig::from_file(path)?,
        Err(_) => PipelineConfig::from_env()?,
    };
    let context = config.into_context()?;
    info!(
        "Starting {} job {} against {}:{}",
        context.database_type, context.job_id, context.connection.hostname, context.connection.port
    );

    let manager = position_manager(context.database_type);
    let position = match env::var("CDC_POSITION") {
        Ok(text) => manager.init_from_text(&text)?,
        Err(_) => manager.init_from_data_source(&context).await?,
    };

    let channel = Arc::new(MemoryChannel::new(context.channel_capacity));
    let dumper = create_dumper(&context, position, channel.clone())?;
    let control = dumper.control();

    let dumper_channel = channel.clone();
    let mut dumper_task = tokio::spawn(async move {
        let result = dumper.start().await;
        dumper_channel.close();
        result
    });

    let consumer_channel = channel.clone();
    let consumer = tokio::spawn(async move {
        loop {
            let records = consumer_channel.fetch(FETCH_BATCH, Duration::from_secs(1)).await;
            if records.is_empty() {
                if consumer_channel.is_closed() {
                    break;
                }
                continue;
            }
            for record in records.iter().filter(|r| r.operation != Operation::Placeholder) {
                match serde_json::to_string(record) {
                    Ok(line) => info!("{}", line),
                    Err(e) => error!("Failed to serialize record at {}: {}", record.position, e),
                }
            }
            consumer_channel.ack(&records);
        }
    });

    let result = tokio::select! {
        joined = &mut dumper_task => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            control.stop();
            dumper_task.await
        }
    };
    channel.close();
    consumer.await?;

    info!(
        "Dumper finished in state {} at {}",
        control.state(),
        control.position()
    );
    result??;
    Ok(())
}
