mod agents;
mod knowledge;
mod llm_client;
mod prompt;
mod rag;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agents::{AgentBehavior, Attachment, ChatTurnRequest, EstimatorAgent, StreamEvent};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use knowledge::{KnowledgeConfig, KnowledgeContext};
use llm_client::{build_llm_client_from_env, ChatConfig, EchoLlmClient};
use prompt::{BuildingType, CompanyProfile, ConversationTurn, PromptAssembler, PromptLimits};
use rag::{build_rag_agent_from_env, DocumentSource, SharedRagAgent};
use tracing::{error, info, warn};

const PROFILE_PATH_VARS: [&str; 2] = ["ESTIMAIT_PROFILE_PATH", "GC_PROFILE_PATH"];
const INGESTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(
    name = "estimait",
    about = "Construction cost estimation assistant backed by a layered knowledge base"
)]
struct Cli {
    /// Optional one-shot prompt; if omitted the CLI enters interactive mode.
    #[arg(short, long)]
    prompt: Option<String>,

    /// Conversation the uploaded documents belong to.
    #[arg(long, global = true, default_value = "default")]
    conversation: String,

    /// Building type selection; overrides classification of the message text.
    #[arg(long, global = true)]
    building_type: Option<BuildingType>,

    /// GC company profile (JSON).
    #[arg(long, global = true)]
    profile: Option<PathBuf>,

    /// Prior turns as a JSON array of {"role", "content"} objects.
    #[arg(long, global = true)]
    history: Option<PathBuf>,

    /// File (path or URL) attached to the first turn; repeat for several.
    #[arg(long = "attach", global = true)]
    attachments: Vec<String>,

    /// Emit `data: {...}` server-sent-event frames instead of plain text.
    #[arg(long, global = true, default_value_t = false)]
    sse: bool,

    /// Knowledge base root; defaults to ESTIMAIT_KNOWLEDGE_DIR or the current directory.
    #[arg(long, global = true)]
    knowledge_dir: Option<PathBuf>,

    /// Use the offline echo model instead of a configured model endpoint.
    #[arg(long, global = true, default_value_t = false)]
    offline: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the bounded system instructions for a message without calling the model.
    Assemble {
        message: String,
        /// Print the assembly report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the condensed knowledge index built from the registry.
    Registry {
        #[arg(long)]
        lines: Option<usize>,
    },
    /// Resolve a knowledge reference to a file on disk.
    Resolve { name: String },
    /// Chunk, embed and store a document for the conversation.
    Ingest {
        /// Local path or URL of the document.
        source: String,
        /// Stored file name; defaults to the last segment of the source.
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the document context retrieved for a message.
    Context { message: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let limits = PromptLimits::from_env();
    let knowledge_config = match &cli.knowledge_dir {
        Some(dir) => KnowledgeConfig::for_base(dir),
        None => KnowledgeConfig::from_env(),
    };
    let knowledge = Arc::new(
        KnowledgeContext::load(knowledge_config, limits)
            .await
            .context("Knowledge base initialization failed")?,
    );

    match &cli.command {
        Some(Commands::Registry { lines }) => {
            let lines = lines.unwrap_or(knowledge.limits().registry_index_lines);
            println!("{}", knowledge.registry().index_summary(lines));
            return Ok(());
        }
        Some(Commands::Resolve { name }) => {
            match knowledge.resolver().resolve(name) {
                Some(path) => println!("{}", path.display()),
                None => bail!("No knowledge file matches '{name}'"),
            }
            return Ok(());
        }
        _ => {}
    }

    let rag_agent = build_rag_agent_from_env(true)
        .context("Failed to initialize document retrieval")?;
    let chat_config = ChatConfig::from_env();
    let llm_client = if cli.offline {
        EchoLlmClient::shared()
    } else {
        build_llm_client_from_env(&chat_config, false)
            .context("LLM client initialization failed")?
    };

    let agent = EstimatorAgent::new(
        PromptAssembler::new(knowledge.clone()),
        llm_client,
        rag_agent.clone(),
        chat_config.request_deadline,
    );
    let mut session = Session::from_cli(&cli, agent).await?;

    if let Some(command) = &cli.command {
        match command {
            Commands::Assemble { message, json } => {
                let assembled = session.agent.prepare(&session.request(message)).await;
                if *json {
                    println!("{}", serde_json::to_string_pretty(&assembled)?);
                } else {
                    println!("{}", assembled.system);
                }
            }
            Commands::Ingest { source, name } => {
                let rag_agent = rag_agent.context("Document retrieval is not configured")?;
                run_ingest(&rag_agent, &cli.conversation, source, name.as_deref()).await?;
            }
            Commands::Context { message } => {
                let rag_agent = rag_agent.context("Document retrieval is not configured")?;
                let context = rag_agent
                    .context(&cli.conversation, message, &session.history)
                    .await;
                println!("{context}");
            }
            Commands::Registry { .. } | Commands::Resolve { .. } => {}
        }
        return Ok(());
    }

    let result = match cli.prompt.clone() {
        Some(prompt) => session.turn(prompt).await,
        None => run_repl(&mut session).await,
    };

    if let Some(rag_agent) = &rag_agent {
        drain_ingestion(rag_agent, &cli.conversation, INGESTION_DRAIN_TIMEOUT).await?;
    }
    result
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

/// Conversation state carried across turns of one CLI run.
struct Session {
    agent: EstimatorAgent,
    conversation_id: String,
    building_type: Option<BuildingType>,
    profile: Option<CompanyProfile>,
    history: Vec<ConversationTurn>,
    pending_attachments: Vec<Attachment>,
    sse: bool,
}

impl Session {
    async fn from_cli(cli: &Cli, agent: EstimatorAgent) -> anyhow::Result<Self> {
        let profile_path = cli.profile.clone().or_else(|| {
            rag::config::RagConfig::read_env(&PROFILE_PATH_VARS).map(PathBuf::from)
        });
        let profile = match profile_path {
            Some(path) => Some(CompanyProfile::load(&path).await?),
            None => None,
        };
        let history = match &cli.history {
            Some(path) => load_history(path).await?,
            None => Vec::new(),
        };

        Ok(Self {
            agent,
            conversation_id: cli.conversation.clone(),
            building_type: cli.building_type,
            profile,
            history,
            pending_attachments: cli.attachments.iter().map(|raw| Attachment::parse(raw)).collect(),
            sse: cli.sse,
        })
    }

    fn request(&self, message: &str) -> ChatTurnRequest {
        ChatTurnRequest {
            conversation_id: self.conversation_id.clone(),
            message: message.to_string(),
            history: self.history.clone(),
            building_type: self.building_type,
            attachments: self.pending_attachments.clone(),
            profile: self.profile.clone(),
        }
    }

    async fn turn(&mut self, message: String) -> anyhow::Result<()> {
        self.turn_to(message, &mut io::stdout()).await
    }

    /// Run one turn, writing the reply (or SSE frames) to `out`. With SSE a
    /// turn that fails before streaming starts is reported as an error frame.
    async fn turn_to<W: Write>(&mut self, message: String, out: &mut W) -> anyhow::Result<()> {
        let request = self.request(&message);
        let mut events = match self.agent.run_turn(request).await {
            Ok(events) => events,
            Err(err) if self.sse => {
                error!(?err, "Estimator turn failed");
                let frame = StreamEvent::Error {
                    error: format!("{err:#}"),
                };
                write!(out, "{}", frame.to_sse()?)?;
                out.flush()?;
                return Ok(());
            }
            Err(err) => {
                error!(?err, "Estimator turn failed");
                return Err(err);
            }
        };
        self.pending_attachments.clear();

        let mut reply = String::new();
        while let Some(event) = events.next().await {
            if self.sse {
                write!(out, "{}", event.to_sse()?)?;
                out.flush()?;
            }
            match event {
                StreamEvent::Delta { text } => {
                    if !self.sse {
                        write!(out, "{text}")?;
                        out.flush()?;
                    }
                    reply.push_str(&text);
                }
                StreamEvent::Done => {
                    if !self.sse {
                        writeln!(out)?;
                    }
                }
                StreamEvent::Error { error } => {
                    error!(%error, "Model stream ended with an error");
                    if !self.sse {
                        eprintln!("\n[error] {error}");
                    }
                }
            }
        }

        self.history.push(ConversationTurn::user(message));
        if !reply.is_empty() {
            self.history.push(ConversationTurn::assistant(reply));
        }
        Ok(())
    }
}

async fn load_history(path: &Path) -> anyhow::Result<Vec<ConversationTurn>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read history file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("History file {} is not a JSON turn list", path.display()))
}

/// Wait for uploads queued during the session so they are stored before the
/// runtime shuts down. Returns the files still pending after `timeout`.
async fn drain_ingestion(
    rag_agent: &SharedRagAgent,
    conversation_id: &str,
    timeout: Duration,
) -> anyhow::Result<Vec<String>> {
    let pending = rag_agent.pending_ingestion(conversation_id)?;
    if pending.is_empty() {
        return Ok(pending);
    }

    info!(?pending, "Waiting for document ingestion to finish");
    if rag_agent.wait_for_ingestion(conversation_id, timeout).await? {
        return Ok(Vec::new());
    }
    let pending = rag_agent.pending_ingestion(conversation_id)?;
    warn!(?pending, "Exiting before document ingestion finished");
    Ok(pending)
}

async fn run_ingest(
    rag_agent: &SharedRagAgent,
    conversation_id: &str,
    source: &str,
    name: Option<&str>,
) -> anyhow::Result<()> {
    let source = DocumentSource::parse(source);
    let file_name = name.map(str::to_string).unwrap_or_else(|| source.file_name());
    let status = rag_agent
        .ingest_now(conversation_id, &file_name, source)
        .await
        .context("Ingestion task failed")?;
    info!(conversation_id, file_name = %file_name, ?status, "Ingestion complete");
    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}

async fn run_repl(session: &mut Session) -> anyhow::Result<()> {
    println!("EstimAIt CLI ready. Type 'exit' to quit.\n");
    let stdin = io::stdin();

    loop {
        print!("You > ");
        io::stdout().flush()?;

        let mut buffer = String::new();
        if stdin.read_line(&mut buffer)? == 0 {
            break;
        }
        let trimmed = buffer.trim();

        if trimmed.eq_ignore_ascii_case("exit") {
            info!("User exited CLI");
            break;
        }

        if trimmed.is_empty() {
            continue;
        }

        if let Err(err) = session.turn(trimmed.to_owned()).await {
            eprintln!("[error] {err:#}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clap::CommandFactory;

    use crate::knowledge::context::tests::{knowledge_tree, load_context};
    use crate::llm_client::{LlmClient, SharedLlmClient, TextStream};
    use crate::rag::embed::{EmbeddingsProvider, HashingEmbedder};
    use crate::rag::memory_store::InMemoryChunkStore;
    use crate::rag::{IngestStatus, RagAgent, RagConfig};

    struct UnreachableLlm;

    #[async_trait]
    impl LlmClient for UnreachableLlm {
        async fn stream_chat(
            &self,
            _system: &str,
            _turns: &[ConversationTurn],
        ) -> anyhow::Result<TextStream> {
            anyhow::bail!("upstream unavailable")
        }
    }

    struct SlowEmbedder(Duration);

    #[async_trait]
    impl EmbeddingsProvider for SlowEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            tokio::time::sleep(self.0).await;
            HashingEmbedder::new(16).embed(text).await
        }
    }

    async fn session(
        root: &Path,
        llm: SharedLlmClient,
        rag: Option<SharedRagAgent>,
        sse: bool,
    ) -> Session {
        let assembler = PromptAssembler::new(Arc::new(load_context(root).await));
        Session {
            agent: EstimatorAgent::new(assembler, llm, rag, Duration::from_secs(5)),
            conversation_id: "c1".to_string(),
            building_type: None,
            profile: None,
            history: Vec::new(),
            pending_attachments: Vec::new(),
            sse,
        }
    }

    #[tokio::test]
    async fn sse_turn_reports_model_failure_as_error_frame() {
        let tmp = knowledge_tree();
        let mut session = session(tmp.path(), Arc::new(UnreachableLlm), None, true).await;

        let mut out = Vec::new();
        session.turn_to("hi".to_string(), &mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("data: {\"type\":\"error\",\"error\":\""));
        assert!(out.contains("upstream unavailable"));
        assert!(out.ends_with("\n\n"));
        assert!(session.history.is_empty());
    }

    #[tokio::test]
    async fn plain_turn_propagates_model_failure() {
        let tmp = knowledge_tree();
        let mut session = session(tmp.path(), Arc::new(UnreachableLlm), None, false).await;
        let mut out = Vec::new();
        assert!(session.turn_to("hi".to_string(), &mut out).await.is_err());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn one_shot_turn_finishes_attachment_ingestion() {
        let tmp = knowledge_tree();
        let pdf = tmp.path().join("plans.pdf");
        std::fs::write(&pdf, "not a real pdf").unwrap();
        let rag: SharedRagAgent = Arc::new(RagAgent::in_memory(RagConfig::default()));

        let mut session = session(tmp.path(), EchoLlmClient::shared(), Some(rag.clone()), false).await;
        session.pending_attachments = vec![Attachment::parse(&pdf.to_string_lossy())];
        let mut out = Vec::new();
        session.turn_to("estimate".to_string(), &mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().contains("[Attached Files: plans.pdf"));

        let pending = drain_ingestion(&rag, "c1", Duration::from_secs(5)).await.unwrap();
        assert!(pending.is_empty());
        let jobs = rag.ingestion_jobs("c1").unwrap();
        assert_eq!(jobs.len(), 1);
        assert_ne!(jobs[0].status, IngestStatus::Pending);
    }

    #[tokio::test]
    async fn drain_reports_files_still_ingesting() {
        let rag: SharedRagAgent = Arc::new(RagAgent::new(
            Arc::new(SlowEmbedder(Duration::from_millis(300))),
            Arc::new(InMemoryChunkStore::new()),
            RagConfig::default(),
        ));
        rag.ingest_text("c1", "bod.txt", "Two story clinic".to_string());

        let pending = drain_ingestion(&rag, "c1", Duration::from_millis(20)).await.unwrap();
        assert_eq!(pending, vec!["bod.txt"]);

        assert!(drain_ingestion(&rag, "c1", Duration::from_secs(5)).await.unwrap().is_empty());
        assert_eq!(
            rag.ingestion_jobs("c1").unwrap()[0].status,
            IngestStatus::Succeeded { chunks: 1 }
        );
    }

    #[test]
    fn cli_accepts_prompt_flag_headlessly() {
        let cli = Cli::parse_from(["estimait", "--prompt", "hello"]);
        assert_eq!(cli.prompt.as_deref(), Some("hello"));
        assert_eq!(cli.conversation, "default");
        assert!(cli.command.is_none());
    }

    #[test]
    fn cli_help_is_emitted_as_error_kind() {
        let err = Cli::command()
            .try_get_matches_from(["estimait", "--help"])
            .expect_err("help should short-circuit");
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn global_options_follow_subcommands() {
        let cli = Cli::parse_from([
            "estimait",
            "assemble",
            "new clinic",
            "--building-type",
            "healthcare",
            "--conversation",
            "c42",
        ]);
        assert_eq!(cli.building_type, Some(BuildingType::Healthcare));
        assert_eq!(cli.conversation, "c42");
        assert!(matches!(
            cli.command,
            Some(Commands::Assemble { ref message, json: false }) if message == "new clinic"
        ));
    }

    #[test]
    fn unknown_building_type_is_rejected() {
        let err = Cli::command()
            .try_get_matches_from(["estimait", "--building-type", "castle"])
            .expect_err("invalid building type");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn ingest_and_attachments_parse() {
        let cli = Cli::parse_from([
            "estimait",
            "--attach",
            "a.pdf",
            "--attach",
            "b.md",
            "ingest",
            "https://blob.example.com/set.pdf",
            "--name",
            "Drawing Set.pdf",
        ]);
        assert_eq!(cli.attachments, vec!["a.pdf", "b.md"]);
        match cli.command {
            Some(Commands::Ingest { source, name }) => {
                assert_eq!(source, "https://blob.example.com/set.pdf");
                assert_eq!(name.as_deref(), Some("Drawing Set.pdf"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn history_files_are_turn_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(
            &path,
            r#"[{"role":"user","content":"hi"},{"role":"assistant","content":"Stage A: ..."}]"#,
        )
        .unwrap();
        let history = load_history(&path).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1].is_assistant());

        std::fs::write(&path, "{}").unwrap();
        assert!(load_history(&path).await.is_err());
    }
}
