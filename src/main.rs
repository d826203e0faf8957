use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use webreplay::{
    browser,
    config::Config,
    logging,
    recorder::Recorder,
    resource_store::ResourceStore,
    server,
    session::{SessionDetail, SessionId, SessionStatus, SessionSummary},
};

#[derive(Debug, Parser)]
#[command(name = "webreplay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the recording and replay API.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Inspect and delete recorded sessions.
    Sessions {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(subcommand)]
        action: SessionsCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum SessionsCommand {
    /// List recorded sessions, newest first.
    List {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print a session and its resources as JSON.
    Show { id: String },
    /// Delete a session and every stored payload.
    Delete {
        id: String,
        /// Also delete sessions still marked as recording.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug)]
enum SessionsCommandOutcome {
    Listed {
        sessions: Vec<SessionSummary>,
        total: u64,
    },
    Shown(SessionDetail),
    Deleted {
        id: SessionId,
        blobs_deleted: usize,
    },
}

async fn run_sessions_command(
    store: &ResourceStore,
    command: SessionsCommand,
) -> anyhow::Result<SessionsCommandOutcome> {
    match command {
        SessionsCommand::List { page, limit } => {
            if page == 0 || limit == 0 {
                bail!("`--page` and `--limit` must be positive");
            }
            let offset = (page - 1).saturating_mul(limit);
            let sessions = store.sessions().list_sessions(offset, limit).await?;
            let total = store.sessions().count_sessions().await?;
            Ok(SessionsCommandOutcome::Listed { sessions, total })
        }
        SessionsCommand::Show { id } => {
            let id = SessionId::parse(&id)?;
            let detail = store.session(&id).await?;
            Ok(SessionsCommandOutcome::Shown(detail))
        }
        SessionsCommand::Delete { id, force } => {
            let id = SessionId::parse(&id)?;
            let detail = store.session(&id).await?;
            if detail.session.status == SessionStatus::Recording && !force {
                bail!("session `{id}` is still recording; stop it first or pass `--force`");
            }
            let deleted = store.delete_session(&id).await?;
            Ok(SessionsCommandOutcome::Deleted {
                id: deleted.session_id,
                blobs_deleted: deleted.blobs_deleted,
            })
        }
    }
}

fn print_sessions_command_outcome(outcome: SessionsCommandOutcome) -> anyhow::Result<()> {
    match outcome {
        SessionsCommandOutcome::Listed { sessions, total } => {
            for summary in &sessions {
                println!(
                    "{}\t{}\t{} resources\t{}",
                    summary.session.id,
                    summary.session.status.as_str(),
                    summary.resource_count,
                    summary.session.url
                );
            }
            eprintln!("{} of {total} sessions", sessions.len());
        }
        SessionsCommandOutcome::Shown(detail) => {
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        SessionsCommandOutcome::Deleted { id, blobs_deleted } => {
            println!("deleted session `{id}` ({blobs_deleted} blobs)");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let store = ResourceStore::open_in_dir(&config.storage.path)?;
            let recorder = Recorder::new(
                browser::default_launcher(),
                store,
                config.recorder_settings(),
            );
            let server = server::serve(config.server.listen, recorder.clone()).await?;
            eprintln!("{}", startup_summary(&config, server.listen_addr));

            tokio::signal::ctrl_c().await?;
            if let Some(stopped) = recorder.stop_active().await {
                match stopped {
                    Ok(outcome) => tracing::info!(
                        session_id = %outcome.session_id,
                        resource_count = outcome.resource_count,
                        "stopped active recording on shutdown"
                    ),
                    Err(err) => {
                        tracing::warn!("failed to stop active recording on shutdown: {err}")
                    }
                }
            }
            server.shutdown().await;
        }
        Command::Sessions { config, action } => {
            let config = Config::load(config.as_deref())?;
            let store = ResourceStore::open_in_dir(&config.storage.path)?;
            let outcome = run_sessions_command(&store, action).await?;
            print_sessions_command_outcome(outcome)?;
        }
    }

    Ok(())
}

fn startup_summary(config: &Config, listen_addr: std::net::SocketAddr) -> String {
    let inline_cap = config
        .routing_policy()
        .max_inline_bytes_per_session
        .map(|cap| cap.to_string())
        .unwrap_or_else(|| "disabled".to_owned());
    let config_source = config
        .source()
        .map(ToString::to_string)
        .unwrap_or_else(|| "defaults".to_owned());
    let browser = if cfg!(feature = "chrome") {
        "chrome"
    } else {
        "unavailable"
    };

    format!(
        "startup config: listen={}, storage_path={}, large_object_threshold_bytes={}, max_inline_bytes_per_session={}, browser={}, config_source={}",
        listen_addr,
        config.storage.path.display(),
        config.storage.large_object_threshold_bytes,
        inline_cap,
        browser,
        config_source
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use bytes::Bytes;
    use clap::Parser;
    use webreplay::{
        config::Config,
        resource_store::ResourceStore,
        session::{NewResource, NewSession, ResourceMeta, ResourcePayload, SessionId},
    };

    use super::{
        Cli, Command, SessionsCommand, SessionsCommandOutcome, run_sessions_command,
        startup_summary,
    };

    async fn store_with_session(dir: &std::path::Path, id: &str) -> ResourceStore {
        let store = ResourceStore::open_in_dir(dir).expect("store should open");
        store
            .sessions()
            .create_session(NewSession {
                id: SessionId::parse(id).expect("id should parse"),
                url: "https://example.test/".to_owned(),
                started_at_unix_ms: 1,
                resources: vec![NewResource {
                    meta: ResourceMeta {
                        url: "https://example.test/".to_owned(),
                        status: 200,
                        content_type: "text/html".to_owned(),
                        captured_at_unix_ms: 1,
                    },
                    payload: ResourcePayload::Inline(Bytes::from_static(b"<html></html>")),
                }],
            })
            .await
            .expect("session should be created");
        store
    }

    #[test]
    fn serve_parses_with_config_and_log_level_flags() {
        let cli = Cli::try_parse_from([
            "webreplay",
            "serve",
            "--config",
            "custom.toml",
            "--log-level",
            "debug",
        ])
        .expect("cli parse should succeed");
        let Command::Serve { config, log_level } = cli.command else {
            panic!("expected serve command, got {:?}", cli.command);
        };
        assert_eq!(config, Some(PathBuf::from("custom.toml")));
        assert_eq!(log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn sessions_list_uses_default_pagination() {
        let cli = Cli::try_parse_from(["webreplay", "sessions", "list"])
            .expect("cli parse should succeed");
        let Command::Sessions { config, action } = cli.command else {
            panic!("expected sessions command, got {:?}", cli.command);
        };
        assert_eq!(config, None);
        assert_eq!(action, SessionsCommand::List { page: 1, limit: 20 });
    }

    #[test]
    fn sessions_delete_parses_force_flag() {
        let cli = Cli::try_parse_from(["webreplay", "sessions", "delete", "abc", "--force"])
            .expect("cli parse should succeed");
        let Command::Sessions { action, .. } = cli.command else {
            panic!("expected sessions command, got {:?}", cli.command);
        };
        assert_eq!(
            action,
            SessionsCommand::Delete {
                id: "abc".to_owned(),
                force: true
            }
        );
    }

    #[tokio::test]
    async fn sessions_list_show_delete_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = store_with_session(dir.path(), "first").await;

        let listed = run_sessions_command(&store, SessionsCommand::List { page: 1, limit: 20 })
            .await
            .expect("list should succeed");
        let SessionsCommandOutcome::Listed { sessions, total } = listed else {
            panic!("expected list outcome, got {listed:?}");
        };
        assert_eq!(total, 1);
        assert_eq!(sessions[0].resource_count, 1);

        let shown = run_sessions_command(&store, SessionsCommand::Show { id: "first".to_owned() })
            .await
            .expect("show should succeed");
        assert!(
            matches!(shown, SessionsCommandOutcome::Shown(detail) if detail.resources.len() == 1)
        );

        let err = run_sessions_command(
            &store,
            SessionsCommand::Delete {
                id: "first".to_owned(),
                force: false,
            },
        )
        .await
        .expect_err("recording session should not be deleted without --force");
        assert!(err.to_string().contains("still recording"), "error: {err}");

        let deleted = run_sessions_command(
            &store,
            SessionsCommand::Delete {
                id: "first".to_owned(),
                force: true,
            },
        )
        .await
        .expect("forced delete should succeed");
        assert!(matches!(deleted, SessionsCommandOutcome::Deleted { blobs_deleted: 0, .. }));

        let err = run_sessions_command(&store, SessionsCommand::Show { id: "first".to_owned() })
            .await
            .expect_err("deleted session should be gone");
        assert!(err.to_string().contains("was not found"), "error: {err}");
    }

    #[test]
    fn startup_summary_reports_storage_and_source() {
        let config = Config::from_toml_str(
            r#"
[storage]
path = "/tmp/webreplay"
max_inline_bytes_per_session = 0
"#,
        )
        .expect("config should parse");
        let summary = startup_summary(&config, "127.0.0.1:5000".parse().expect("addr"));
        assert!(summary.contains("listen=127.0.0.1:5000"), "{summary}");
        assert!(summary.contains("storage_path=/tmp/webreplay"), "{summary}");
        assert!(summary.contains("max_inline_bytes_per_session=disabled"), "{summary}");
        assert!(summary.contains("config_source=defaults"), "{summary}");
    }
}
