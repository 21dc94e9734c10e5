use std::path::PathBuf;

use infer_bridge::config::AppConfig;
use infer_bridge::inference::llm::LoopbackLlm;
use infer_bridge::orchestration::EngineWorker;
use infer_bridge::{ChatSession, EngineClient};

const DEFAULT_PROMPTS: &[&str] = &[
    "Hello, who are you?",
    "Summarise the last message in one line.",
    "What can you do offline?",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let prompts: Vec<String> = args
        .iter()
        .enumerate()
        .filter(|(_, a)| *a == "--prompt")
        .filter_map(|(i, _)| args.get(i + 1).cloned())
        .collect();

    let config = AppConfig::load(config_path.as_deref())?;

    let level = if config.engine.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let worker = EngineWorker::spawn(LoopbackLlm::new("loopback"))?;
    let client = EngineClient::new(worker.handle());

    if let Err(e) = client.initialize(&config.engine).await?.into_result() {
        worker.shutdown().await;
        anyhow::bail!("engine refused to initialize: {e}");
    }
    let status = client
        .wait_until_ready(config.polling.ready_interval, config.polling.deadline)
        .await?;
    tracing::info!("model {} ready", status.version);

    let prompts: Vec<String> = if prompts.is_empty() {
        DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect()
    } else {
        prompts
    };

    let mut session = ChatSession::new(client, config.polling.clone());
    for prompt in &prompts {
        println!("> {prompt}");
        match session.ask(prompt).await {
            Ok(reply) => {
                println!("{}", reply.text);
                println!(
                    "  [{} chunks, {} polls, {:.0}ms]",
                    reply.chunks, reply.polls, reply.elapsed_ms
                );
            }
            Err(e) => eprintln!("  error: {e}"),
        }
        session.clear_prompt().await?;
    }

    worker.shutdown().await;
    Ok(())
}
