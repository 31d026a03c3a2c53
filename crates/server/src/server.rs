//! Line-delimited JSON socket transport.
//!
//! Each connection gets its own fully isolated [`AdventureSession`]: engine
//! events stream out as they happen (including mid-phase narrative updates),
//! commands come in one JSON object per line.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use fabula_config::AppConfig;
use fabula_engine::state::load_story_parameters;
use fabula_engine::{
    AdventureSession, EngineEvent, FeedbackKind, ImageUpdate, TurnFeedback,
};
use fabula_llm::OpenRouterClient;
use fabula_memory::ApiEmbedder;

use crate::image::{GeneratorOptions, ImageGenerator};
use crate::protocol::{ClientCommand, ServerEvent};

pub async fn run_server(config: AppConfig) -> Result<()> {
    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    info!(addr = %config.server.listen_addr, "server listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "client connected");
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(fault) = handle_connection(config, stream).await {
                warn!(%fault, "connection closed with error");
            }
        });
    }
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

async fn send_event(writer: &SharedWriter, event: &ServerEvent) -> Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    writer.lock().await.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn send_error(writer: &SharedWriter, message: impl Into<String>) {
    let event = ServerEvent::Error {
        error: message.into(),
    };
    if let Err(fault) = send_event(writer, &event).await {
        warn!(%fault, "failed to send error event");
    }
}

/// Render (or fetch cached) images for an update and push them to the client.
async fn forward_image(
    writer: &SharedWriter,
    generator: &ImageGenerator,
    model: &watch::Receiver<String>,
    update: &ImageUpdate,
) -> Result<()> {
    if update.image_prompt.is_empty() {
        return Ok(());
    }
    let options = GeneratorOptions {
        model: model.borrow().clone(),
        prompt: update.image_prompt.clone(),
        negative_prompt: update.negative_prompt.clone(),
    };
    match generator.generate_image(&options).await {
        Ok(files) if !files.is_empty() => {
            send_event(
                writer,
                &ServerEvent::ImageUpdate {
                    role: update.role,
                    files,
                },
            )
            .await
        }
        Ok(_) => Ok(()),
        Err(fault) => {
            warn!(%fault, role = ?update.role, "image generation failed");
            Ok(())
        }
    }
}

async fn handle_connection(config: AppConfig, stream: TcpStream) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let writer: SharedWriter = Arc::new(Mutex::new(write_half));

    let api_key = config.llm.api_key().unwrap_or_default();
    if api_key.is_empty() {
        warn!("OPENROUTER_API_KEY is not set; model calls will be rejected");
    }
    let client = Arc::new(OpenRouterClient::new(&config.llm.api_url, api_key));
    let embedder = Arc::new(ApiEmbedder::new(
        &config.llm.embedding_url,
        &config.llm.embedding_model,
        config.llm.embedding_dimension,
    ));
    let mut session = AdventureSession::new(&config, client, embedder);
    session.start().await?;
    let generator = Arc::new(ImageGenerator::new(&config.image)?);
    let (model_tx, model_rx) = watch::channel(session.image_parameters().model.clone());

    // Fan engine events out to the socket for the lifetime of the connection.
    let mut events = session.subscribe();
    {
        let writer = writer.clone();
        let generator = generator.clone();
        let model_rx = model_rx.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let outcome = match event {
                    EngineEvent::TurnUpdated(turn) => {
                        send_event(&writer, &ServerEvent::TurnUpdate { content: turn }).await
                    }
                    EngineEvent::LlmRunningChanged(running) => {
                        send_event(&writer, &ServerEvent::LlmRunning { content: running }).await
                    }
                    EngineEvent::ImageRequested(update) => {
                        forward_image(&writer, &generator, &model_rx, &update).await
                    }
                };
                if outcome.is_err() {
                    break;
                }
            }
        });
    }

    // Replay the existing story so a reconnecting client catches up.
    for turn in session.all_turns().to_vec() {
        send_event(&writer, &ServerEvent::TurnUpdate { content: turn }).await?;
    }
    if let Some(turn) = session.last_turn() {
        for update in turn.images.clone() {
            forward_image(&writer, &generator, &model_rx, &update).await?;
        }
    }

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command: ClientCommand = match serde_json::from_str(&line) {
            Ok(command) => command,
            Err(fault) => {
                send_error(&writer, format!("unrecognized command: {fault}")).await;
                continue;
            }
        };
        match command {
            ClientCommand::Action {
                character_action,
                instructions,
            } => {
                if !session.is_story_started() {
                    let story = match load_story_parameters(&config.story.story_parameters_path) {
                        Ok(story) => story,
                        Err(fault) => {
                            send_error(&writer, format!("failed to load story: {fault:#}")).await;
                            continue;
                        }
                    };
                    match session.start_story(story).await {
                        Ok(result) if result.is_failed() => {
                            send_error(&writer, result.errors.join("; ")).await;
                        }
                        Ok(_) => {
                            let _ = model_tx.send(session.image_parameters().model.clone());
                        }
                        Err(fault) => {
                            send_error(&writer, format!("failed to start story: {fault:#}")).await;
                        }
                    }
                } else {
                    let result = session.perform_turn(character_action, instructions).await;
                    if result.is_failed() {
                        // The cancellation marker already went out with the
                        // engine events; log the detail server-side.
                        warn!(errors = ?result.errors, "turn cancelled");
                    }
                }
            }
            ClientCommand::Feedback {
                feedback_type,
                feedback_comment,
            } => {
                let kind = match feedback_type.as_str() {
                    "like" => FeedbackKind::Like,
                    "dislike" => FeedbackKind::Dislike,
                    other => {
                        send_error(&writer, format!("unknown feedback type '{other}'")).await;
                        continue;
                    }
                };
                info!(kind = ?kind, comment = %feedback_comment, "feedback received");
                session.add_feedback(TurnFeedback {
                    feedback_type: kind,
                    feedback_comment,
                });
            }
            ClientCommand::RefreshImage { role } => {
                let update = session
                    .last_turn()
                    .and_then(|turn| turn.images.iter().find(|image| image.role == role))
                    .cloned();
                let Some(update) = update else {
                    send_error(&writer, format!("no image for role {role:?}")).await;
                    continue;
                };
                let options = GeneratorOptions {
                    model: model_rx.borrow().clone(),
                    prompt: update.image_prompt.clone(),
                    negative_prompt: update.negative_prompt.clone(),
                };
                if let Err(fault) = generator.clear_image(&options).await {
                    warn!(%fault, "failed to clear cached image");
                }
                forward_image(&writer, &generator, &model_rx, &update).await?;
            }
        }
    }
    info!("client disconnected");
    Ok(())
}
