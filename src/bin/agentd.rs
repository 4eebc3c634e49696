//! `agentd`: API server, worker pool and reaper over a shared SQLite database.
//!
//! ```text
//! agentd serve            # API + workers + reaper in one process
//! agentd api              # submission and polling only
//! agentd worker           # workers + reaper only
//! ```
//!
//! Configuration comes from an optional TOML file overlaid with `AGENT_*` variables.
//! `OPENAI_API_KEY` is read by the provider.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tower_agent_runtime::api::{self, ApiState, ModelCircuitCheck, QueueCheck};
use tower_agent_runtime::clock::system_clock;
use tower_agent_runtime::resilience::{Resilience, SharedStores};
use tower_agent_runtime::{
    tool_typed, AgentBuilder, AgentError, JobQueue, OpenAiProvider, Reaper, RuntimeConfig,
    SharedSink, SqliteStore, ToolDef, ToolError, TracingSink, WorkerPool,
};

#[derive(Parser)]
#[command(name = "agentd", about = "Resilient agent execution service")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "AGENT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// API, workers and reaper in one process
    Serve,
    /// HTTP API only
    Api,
    /// Workers and reaper only
    Worker {
        /// Overrides `worker.concurrency`
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CalculatorArgs {
    /// Arithmetic expression using + - * / and parentheses
    expression: String,
}

fn calculator() -> ToolDef {
    tool_typed(
        "calculator",
        "Evaluate an arithmetic expression",
        |args: CalculatorArgs| async move {
            let value = arith::eval(&args.expression).map_err(ToolError::validation)?;
            Ok(arith::format(value))
        },
    )
}

mod arith {
    //! Tiny recursive-descent evaluator for the demo calculator.

    pub fn eval(input: &str) -> Result<f64, String> {
        let tokens: Vec<char> = input.chars().filter(|c| !c.is_whitespace()).collect();
        let mut p = Parser { tokens, pos: 0 };
        let v = p.expr()?;
        if p.pos != p.tokens.len() {
            return Err(format!("unexpected '{}'", p.tokens[p.pos]));
        }
        if !v.is_finite() {
            return Err("result is not a finite number".into());
        }
        Ok(v)
    }

    pub fn format(v: f64) -> String {
        if v.fract() == 0.0 && v.abs() < 1e15 {
            format!("{}", v as i64)
        } else {
            format!("{v}")
        }
    }

    struct Parser {
        tokens: Vec<char>,
        pos: usize,
    }

    impl Parser {
        fn peek(&self) -> Option<char> {
            self.tokens.get(self.pos).copied()
        }

        fn expr(&mut self) -> Result<f64, String> {
            let mut v = self.term()?;
            while let Some(op @ ('+' | '-')) = self.peek() {
                self.pos += 1;
                let rhs = self.term()?;
                v = if op == '+' { v + rhs } else { v - rhs };
            }
            Ok(v)
        }

        fn term(&mut self) -> Result<f64, String> {
            let mut v = self.factor()?;
            while let Some(op @ ('*' | '/')) = self.peek() {
                self.pos += 1;
                let rhs = self.factor()?;
                v = if op == '*' { v * rhs } else { v / rhs };
            }
            Ok(v)
        }

        fn factor(&mut self) -> Result<f64, String> {
            match self.peek() {
                Some('-') => {
                    self.pos += 1;
                    Ok(-self.factor()?)
                }
                Some('(') => {
                    self.pos += 1;
                    let v = self.expr()?;
                    if self.peek() != Some(')') {
                        return Err("missing ')'".into());
                    }
                    self.pos += 1;
                    Ok(v)
                }
                Some(c) if c.is_ascii_digit() || c == '.' => {
                    let start = self.pos;
                    while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
                        self.pos += 1;
                    }
                    let text: String = self.tokens[start..self.pos].iter().collect();
                    text.parse().map_err(|_| format!("bad number '{text}'"))
                }
                Some(c) => Err(format!("unexpected '{c}'")),
                None => Err("unexpected end of expression".into()),
            }
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig, AgentError> {
    let mut config = match path {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal(token: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    if let Command::Worker {
        concurrency: Some(n),
    } = cli.command
    {
        config.worker.concurrency = n;
    }

    let clock = system_clock();
    let sink: SharedSink = Arc::new(TracingSink);
    let store = Arc::new(SqliteStore::connect(&config.database_url, &config, clock.clone()).await?);
    let queue: Arc<dyn JobQueue> = store.clone();
    let resilience = Resilience::new(
        &config,
        SharedStores::from_store(store.clone()),
        clock.clone(),
        sink.clone(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let run_api = matches!(cli.command, Command::Serve | Command::Api);
    let run_workers = matches!(cli.command, Command::Serve | Command::Worker { .. });

    let pool = if run_workers {
        let agent = AgentBuilder::new(config.clone())
            .tool(calculator())
            .provider(OpenAiProvider::from_config(&config.provider))
            .resilience(resilience.clone())
            .build()?;
        let reaper = Reaper::new(&config, queue.clone(), store.clone(), sink.clone())
            .with_idempotency(resilience.idempotency().clone());
        Some(WorkerPool::start(
            &config,
            queue.clone(),
            store.clone(),
            agent,
            Some(reaper),
            sink.clone(),
        )?)
    } else {
        None
    };

    if run_api {
        let state = ApiState::new(queue.clone(), sink.clone())
            .check(store.clone())
            .check(Arc::new(QueueCheck(queue.clone())))
            .check(Arc::new(ModelCircuitCheck::new(
                resilience.breakers().clone(),
                config.breaker.recovery_timeout,
                clock.clone(),
            )));
        let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
        info!(bind = %config.server.bind, "api listening");
        let token = shutdown.clone();
        axum::serve(listener, api::router(state))
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
    } else {
        shutdown.cancelled().await;
    }

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    info!("stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::arith;

    #[test]
    fn evaluates_with_precedence() {
        assert_eq!(arith::eval("15*23").unwrap(), 345.0);
        assert_eq!(arith::eval("2 + 3 * (4 - 1)").unwrap(), 11.0);
        assert_eq!(arith::format(arith::eval("-7/2").unwrap()), "-3.5");
        assert!(arith::eval("1/0").is_err());
        assert!(arith::eval("2 +").is_err());
        assert!(arith::eval("abc").is_err());
    }
}
