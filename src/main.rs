use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use memoria::clip::ClipEmbedder;
use memoria::cloud::LocalLibraryStore;
use memoria::config::EmbeddingBackend;
use memoria::db::Database;
use memoria::features::{EmbeddingOracle, RemoteEmbeddingClient};
use memoria::jobs::Credentials;
use memoria::llm::LlmClient;
use memoria::pipeline::{PromptKind, DEFAULT_PROMPT_SET};
use memoria::{logging, AnalysisService, Config, JobId};

const PASSWORD_ENV: &str = "MEMORIA_CLOUD_PASSWORD";

#[derive(Debug, PartialEq)]
enum Command {
    Analyze {
        user: String,
        email: String,
        password: Option<String>,
        prompt_set: String,
    },
    ResumePassword {
        job: JobId,
        password: Option<String>,
        email: Option<String>,
    },
    ResumeCode {
        job: JobId,
        code: String,
        email: Option<String>,
        password: Option<String>,
    },
    Reanalyze {
        job: JobId,
        email: Option<String>,
        password: Option<String>,
    },
    Status {
        job: JobId,
    },
    Jobs {
        user: String,
    },
    Protagonist {
        user: String,
        photo: PathBuf,
        prompt_set: String,
    },
    SetPrompt {
        prompt_set: String,
        kind: PromptKind,
        file: PathBuf,
    },
}

#[derive(Debug, PartialEq)]
struct Cli {
    config_path: Option<PathBuf>,
    command: Command,
}

/// Flags and positionals of one subcommand.
#[derive(Default)]
struct Flags {
    values: Vec<(String, String)>,
    positional: Vec<String>,
}

impl Flags {
    fn take(&mut self, name: &str) -> Option<String> {
        let idx = self.values.iter().position(|(k, _)| k == name)?;
        Some(self.values.remove(idx).1)
    }

    fn require(&mut self, name: &str) -> Result<String> {
        self.take(name)
            .with_context(|| format!("{} requires a value", name))
    }

    fn job(&mut self) -> Result<JobId> {
        let raw = if self.positional.is_empty() {
            bail!("a job id is required");
        } else {
            self.positional.remove(0)
        };
        let id = raw
            .parse::<i64>()
            .with_context(|| format!("invalid job id: {}", raw))?;
        Ok(JobId(id))
    }

    fn finish(self) -> Result<()> {
        if let Some((name, _)) = self.values.first() {
            bail!("unexpected option: {}", name);
        }
        if let Some(arg) = self.positional.first() {
            bail!("unexpected argument: {}", arg);
        }
        Ok(())
    }
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config_path = None;
    let mut command_name = None;
    let mut flags = Flags::default();

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("memoria {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let path = args.get(i + 1).context("--config requires a path argument")?;
                config_path = Some(PathBuf::from(path));
                i += 1;
            }
            _ if arg.starts_with("--") => {
                let value = args
                    .get(i + 1)
                    .with_context(|| format!("{} requires a value", arg))?;
                flags.values.push((arg.to_string(), value.clone()));
                i += 1;
            }
            _ if command_name.is_none() => command_name = Some(arg.to_string()),
            _ => flags.positional.push(arg.to_string()),
        }
        i += 1;
    }

    let name = command_name.context("no command given (try --help)")?;
    let prompt_set = |flags: &mut Flags| {
        flags
            .take("--prompt-set")
            .unwrap_or_else(|| DEFAULT_PROMPT_SET.to_string())
    };

    let command = match name.as_str() {
        "analyze" => Command::Analyze {
            user: flags.require("--user")?,
            email: flags.require("--email")?,
            password: flags.take("--password"),
            prompt_set: prompt_set(&mut flags),
        },
        "resume-password" => Command::ResumePassword {
            job: flags.job()?,
            password: flags.take("--password"),
            email: flags.take("--email"),
        },
        "resume-code" => Command::ResumeCode {
            job: flags.job()?,
            code: flags.require("--code")?,
            email: flags.take("--email"),
            password: flags.take("--password"),
        },
        "reanalyze" => Command::Reanalyze {
            job: flags.job()?,
            email: flags.take("--email"),
            password: flags.take("--password"),
        },
        "status" => Command::Status { job: flags.job()? },
        "jobs" => Command::Jobs {
            user: flags.require("--user")?,
        },
        "protagonist" => {
            let user = flags.require("--user")?;
            let prompt_set = prompt_set(&mut flags);
            if flags.positional.is_empty() {
                bail!("protagonist requires a photo path");
            }
            let photo = PathBuf::from(flags.positional.remove(0));
            Command::Protagonist {
                user,
                photo,
                prompt_set,
            }
        }
        "set-prompt" => {
            let prompt_set = prompt_set(&mut flags);
            let kind_name = flags.require("--kind")?;
            let kind = PromptKind::parse(&kind_name)
                .with_context(|| format!("unknown prompt kind: {}", kind_name))?;
            if flags.positional.is_empty() {
                bail!("set-prompt requires a file path");
            }
            let file = PathBuf::from(flags.positional.remove(0));
            Command::SetPrompt {
                prompt_set,
                kind,
                file,
            }
        }
        other => bail!("unknown command: {}", other),
    };
    flags.finish()?;

    Ok(Cli {
        config_path,
        command,
    })
}

fn print_help() {
    println!(
        r#"memoria - behavioural profiles from a cloud photo library

USAGE:
    memoria [--config PATH] <COMMAND>

COMMANDS:
    analyze --user ID --email EMAIL [--password PW] [--prompt-set ID]
    resume-password JOB [--password PW] [--email EMAIL]
    resume-code JOB --code CODE [--email EMAIL --password PW]
    reanalyze JOB [--email EMAIL --password PW]
    status JOB
    jobs --user ID
    protagonist --user ID PHOTO [--prompt-set ID]
    set-prompt --kind phase1|phase2|protagonist [--prompt-set ID] FILE

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    MEMORIA_CONFIG          Path to config file (overrides default location)
    MEMORIA_CLOUD_PASSWORD  Cloud password when --password is omitted
    MEMORIA_LOG             Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/memoria/config.toml"#
    );
}

fn password_or_env(password: Option<String>) -> Option<String> {
    password.or_else(|| std::env::var(PASSWORD_ENV).ok())
}

fn build_embedder(config: &Config) -> Arc<dyn EmbeddingOracle> {
    match config.embedding.backend {
        EmbeddingBackend::Clip => Arc::new(ClipEmbedder::new(&config.embedding.models_dir)),
        EmbeddingBackend::Remote => Arc::new(RemoteEmbeddingClient::new(
            &config.embedding.endpoint,
            Duration::from_secs(config.llm.timeout_secs),
        )),
    }
}

fn print_job(job: &memoria::AnalysisJob) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(job)?);
    Ok(())
}

/// Re-supply credentials to a job when the caller passed any; the vault only
/// lives as long as this process.
async fn refresh_credentials(
    service: &AnalysisService,
    job: JobId,
    email: Option<String>,
    password: Option<String>,
) -> Result<()> {
    if let Some(email) = email {
        service
            .set_credentials(job, Credentials::new(email, password_or_env(password)))
            .await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let db = Arc::new(Database::open(config.db_path())?);
    db.initialize()?;

    if let Command::SetPrompt {
        prompt_set,
        kind,
        file,
    } = &cli.command
    {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("reading {}", file.display()))?;
        db.upsert_prompt(prompt_set, *kind, &content)?;
        println!("stored {} prompt for set '{}'", kind.as_str(), prompt_set);
        return Ok(());
    }

    let cloud = Arc::new(LocalLibraryStore::new(&config.cloud));
    let llm = LlmClient::from_config(&config.llm);
    let embedder = build_embedder(&config);
    let service = AnalysisService::new(config, Arc::clone(&db), cloud, llm, embedder);

    match cli.command {
        Command::Analyze {
            user,
            email,
            password,
            prompt_set,
        } => {
            let credentials = Credentials::new(email, password_or_env(password));
            let job = service.start_analysis(&user, &prompt_set, credentials).await?;
            eprintln!("started job {}", job);
            print_job(&service.wait(job).await?)?;
        }
        Command::ResumePassword {
            job,
            password,
            email,
        } => {
            let password = password_or_env(password)
                .with_context(|| format!("--password or {} is required", PASSWORD_ENV))?;
            refresh_credentials(&service, job, email, None).await?;
            service.resume_with_password(job, password).await?;
            print_job(&service.wait(job).await?)?;
        }
        Command::ResumeCode {
            job,
            code,
            email,
            password,
        } => {
            refresh_credentials(&service, job, email, password).await?;
            service.resume_with_verification(job, code).await?;
            print_job(&service.wait(job).await?)?;
        }
        Command::Reanalyze {
            job,
            email,
            password,
        } => {
            refresh_credentials(&service, job, email, password).await?;
            service.reanalyze(job).await?;
            print_job(&service.wait(job).await?)?;
        }
        Command::Status { job } => print_job(&service.get_job(job).await?)?,
        Command::Jobs { user } => {
            for job in service.list_jobs(&user).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    job.id,
                    job.status,
                    job.created_at,
                    job.error_message.unwrap_or_default()
                );
            }
        }
        Command::Protagonist {
            user,
            photo,
            prompt_set,
        } => {
            let bytes = std::fs::read(&photo)
                .with_context(|| format!("reading {}", photo.display()))?;
            let features = service.extract_protagonist(&user, bytes, &prompt_set).await?;
            println!("{}", serde_json::to_string_pretty(&features)?);
        }
        Command::SetPrompt { .. } => {}
    }

    Ok(())
}
