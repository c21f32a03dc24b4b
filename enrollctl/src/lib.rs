use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use serde::Serialize;
use thiserror::Error;

use enroll_core::{
    load_enroll_config, serve, BatchReport, EnrollConfig, HistoryRecord, HistoryStore,
    HistorySummary, Orchestrator, ProviderRegistry, ValidationProgress, ValidationReport,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] enroll_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history error: {0}")]
    History(#[from] enroll_core::HistoryError),
    #[error("core error: {0}")]
    Core(#[from] enroll_core::RegistrationError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Interface de controle do registrador de contas", long_about = None)]
pub struct Cli {
    /// Caminho do enroll.toml principal
    #[arg(long, default_value = "configs/enroll.toml")]
    pub config: PathBuf,
    /// Caminho alternativo para o arquivo de histórico
    #[arg(long)]
    pub history: Option<PathBuf>,
    /// Token para autenticação local (se ENROLLCTL_TOKEN estiver definido)
    #[arg(long)]
    pub token: Option<String>,
    /// Formato de saída
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Executa um lote de registros
    Run(RunArgs),
    /// Valida as credenciais armazenadas no histórico
    Validate,
    /// Exibe um resumo do estado atual
    Status,
    /// Operações sobre o histórico de registros
    #[command(subcommand)]
    History(HistoryCommands),
    /// Executa verificações de integridade
    #[command(name = "health")]
    #[command(subcommand)]
    Health(HealthCommands),
    /// Gera script de autocompletar para o shell
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Quantidade de contas a registrar (padrão do config)
    #[arg(long)]
    pub target: Option<u32>,
    /// Sessões simultâneas (padrão do config)
    #[arg(long)]
    pub concurrency: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommands {
    /// Lista os registros mais recentes
    Show(HistoryShowArgs),
    /// Remove todos os registros
    Clear,
    /// Exporta o histórico completo em JSON
    Export(HistoryExportArgs),
}

#[derive(Args, Debug)]
pub struct HistoryShowArgs {
    /// Limite de registros retornados
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct HistoryExportArgs {
    /// Arquivo de destino (stdout quando omitido)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Executa checagens básicas
    Check,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell alvo
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        generate(args.shell, &mut command, "enrollctl", &mut io::stdout());
        return Ok(());
    }

    enforce_token(&cli)?;
    init_tracing();
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            let report = runtime.block_on(context.run_batch(args))?;
            render(&report, cli.format)?;
        }
        Commands::Validate => {
            let runtime = tokio::runtime::Runtime::new()?;
            let report = runtime.block_on(context.validate())?;
            render(&report, cli.format)?;
        }
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::History(HistoryCommands::Show(args)) => {
            let list = context.history_show(args)?;
            render(&list, cli.format)?;
        }
        Commands::History(HistoryCommands::Clear) => {
            let report = context.history_clear()?;
            render(&report, cli.format)?;
        }
        Commands::History(HistoryCommands::Export(args)) => {
            context.history_export(args, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "Uma ou mais verificações falharam".to_string(),
                ));
            }
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("ENROLLCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: EnrollConfig,
    config_path: PathBuf,
    history_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_enroll_config(&config_path)?;
        if let Some(history) = &cli.history {
            config.history.path = history.display().to_string();
        }
        let history_path = PathBuf::from(&config.history.path);

        Ok(Self {
            config,
            config_path,
            history_path,
        })
    }

    async fn run_batch(&self, args: &RunArgs) -> Result<BatchReport> {
        let orchestrator = Orchestrator::from_config(self.config.clone())?;
        let handle = serve(Arc::clone(&orchestrator));

        let stopper = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrompendo o lote...");
                let _ = stopper.stop_batch().await;
            }
        });

        let report = handle.start_batch(args.target, args.concurrency).await?;
        orchestrator.shutdown().await;
        Ok(report)
    }

    async fn validate(&self) -> Result<ValidationReport> {
        let orchestrator = Orchestrator::from_config(self.config.clone())?;
        let handle = serve(Arc::clone(&orchestrator));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ValidationProgress>();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                eprintln!("validados {}/{}", event.validated, event.total);
            }
        });

        let report = handle.validate_credentials(Some(tx)).await?;
        let _ = printer.await;
        orchestrator.shutdown().await;
        Ok(report)
    }

    fn gather_status(&self) -> Result<StatusReport> {
        let store = self.open_history()?;
        Ok(StatusReport {
            provider: self.config.mail.provider.clone(),
            history_path: self.config.history.path.clone(),
            history: store.summary(),
        })
    }

    fn history_show(&self, args: &HistoryShowArgs) -> Result<HistoryList> {
        let store = self.open_history()?;
        let rows = store
            .recent(args.limit)
            .into_iter()
            .map(HistoryRow::from)
            .collect();
        Ok(HistoryList { rows })
    }

    fn history_clear(&self) -> Result<ClearReport> {
        let store = self.open_history()?;
        let removed = store.clear()?;
        Ok(ClearReport { removed })
    }

    fn history_export(&self, args: &HistoryExportArgs, format: OutputFormat) -> Result<()> {
        let store = self.open_history()?;
        let json = store.export_json()?;
        match &args.output {
            Some(path) => {
                fs::write(path, &json)?;
                let report = ExportReport {
                    path: path.display().to_string(),
                    records: store.summary().total,
                };
                render(&report, format)?;
            }
            None => println!("{json}"),
        }
        Ok(())
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(self.check_path("enroll.toml", &self.config_path));
        results.push(self.check_provider());
        results.push(self.check_auth());
        results.push(self.check_path(
            "browser",
            Path::new(&self.config.browser.executable_path),
        ));
        results.push(self.check_history_file());
        results
    }

    fn check_auth(&self) -> HealthEntry {
        if self.config.auth.is_configured() {
            HealthEntry::ok("auth", "endpoints configurados".to_string())
        } else {
            HealthEntry::error("auth", "endpoints ausentes em [auth]".to_string())
        }
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} ausente", path = path.display()))
        }
    }

    fn check_provider(&self) -> HealthEntry {
        let registry = ProviderRegistry::from_config(&self.config.mail);
        let id = &self.config.mail.provider;
        match registry.get(id) {
            Ok(provider) if provider.is_configured() => {
                HealthEntry::ok("provider", format!("{id} configurado"))
            }
            Ok(_) => HealthEntry::error("provider", format!("{id} sem configuração completa")),
            Err(err) => HealthEntry::error(
                "provider",
                format!("{err} (disponíveis: {})", registry.ids().join(", ")),
            ),
        }
    }

    fn check_history_file(&self) -> HealthEntry {
        if !self.history_path.exists() {
            return HealthEntry::warn(
                "history.json",
                format!(
                    "{} não encontrado (criado no primeiro uso)",
                    self.history_path.display()
                ),
            );
        }
        match HistoryStore::open(&self.history_path, self.config.history.capacity) {
            Ok(store) => HealthEntry::ok(
                "history.json",
                format!("integridade ok ({} registros)", store.summary().total),
            ),
            Err(err) => HealthEntry::error("history.json", format!("falha ao abrir: {err}")),
        }
    }

    fn open_history(&self) -> Result<HistoryStore> {
        Ok(HistoryStore::open(
            &self.history_path,
            self.config.history.capacity,
        )?)
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub provider: String,
    pub history_path: String,
    pub history: HistorySummary,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let history = &self.history;
        let mut lines = vec![
            format!("Provider: {}", self.provider),
            format!(
                "Histórico: {} ({} registros)",
                self.history_path, history.total
            ),
            format!("  - sucesso: {}", history.succeeded),
            format!("  - falha: {}", history.failed),
        ];
        if history.succeeded > 0 {
            lines.push(format!(
                "  - tokens: válidos={} expirados={} suspensos={} inválidos={} erro={} não verificados={}",
                history.valid,
                history.expired,
                history.suspended,
                history.invalid,
                history.error,
                history.unchecked
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for BatchReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Status: {}", self.status),
            format!("Registrados: {}/{}", self.registered, self.target),
            format!("Falhas: {}", self.failed),
        ];
        if let (Some(start), Some(end)) = (self.started_at, self.finished_at) {
            let elapsed = end.signed_duration_since(start);
            lines.push(format!("Duração: {}s", elapsed.num_seconds()));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for ValidationReport {
    fn display(&self) -> String {
        if self.total == 0 {
            return "Nenhuma credencial elegível para validação".to_string();
        }
        let mut lines = vec![
            format!("Validadas: {}", self.total),
            format!("  - válidas: {}", self.valid),
            format!("  - expiradas: {}", self.expired),
            format!("  - suspensas: {}", self.suspended),
            format!("  - inválidas: {}", self.invalid),
            format!("  - erro: {}", self.error),
        ];
        if !self.details.is_empty() {
            lines.push("Problemas:".to_string());
            for detail in &self.details {
                let note = detail.note.as_deref().unwrap_or("-");
                lines.push(format!(
                    "  {} | status={} | {}",
                    detail.email, detail.status, note
                ));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryList {
    pub rows: Vec<HistoryRow>,
}

/// Listing row stripped of credentials and passwords.
#[derive(Debug, Serialize)]
pub struct HistoryRow {
    pub timestamp: DateTime<Utc>,
    pub email: String,
    pub outcome: String,
    pub token_status: Option<String>,
    pub error: Option<String>,
}

impl From<HistoryRecord> for HistoryRow {
    fn from(record: HistoryRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            email: record.email,
            outcome: if record.success { "ok" } else { "falha" }.to_string(),
            token_status: record.token_status.map(|status| status.to_string()),
            error: record.error,
        }
    }
}

impl DisplayFallback for HistoryList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Histórico vazio".to_string();
        }
        let mut lines = Vec::new();
        for row in &self.rows {
            let token = row.token_status.as_deref().unwrap_or("-");
            let detail = row.error.as_deref().unwrap_or("-");
            lines.push(format!(
                "{} | {} | {} | token={} | {}",
                row.timestamp.format("%Y-%m-%d %H:%M:%S"),
                row.email,
                row.outcome,
                token,
                detail
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ClearReport {
    pub removed: usize,
}

impl DisplayFallback for ClearReport {
    fn display(&self) -> String {
        format!("Removidos {} registros do histórico", self.removed)
    }
}

#[derive(Debug, Serialize)]
pub struct ExportReport {
    pub path: String,
    pub records: usize,
}

impl DisplayFallback for ExportReport {
    fn display(&self) -> String {
        format!(
            "Histórico exportado para {} ({} registros)",
            self.path, self.records
        )
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name} — {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}
