//! h2 session daemon binary. Parses the child command line, environment overrides, and initial
//! terminal dimensions, then starts a session and serves it until the child exits or `stop` is
//! requested. Argument parsing kept in the teacher's manual `std::env::args()` loop style rather
//! than pulling in a CLI-parsing crate the rest of the repo has no other use for.

use h2_core::config;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

struct Args {
    child: String,
    child_args: Vec<String>,
    env: Vec<(String, String)>,
    cols: u16,
    rows: u16,
    session_name: String,
}

fn parse_args() -> Args {
    let raw: Vec<String> = std::env::args().collect();
    let mut child = String::from("bash");
    let mut child_args = Vec::new();
    let mut env = Vec::new();
    let mut cols = DEFAULT_COLS;
    let mut rows = DEFAULT_ROWS;
    let mut session_name = format!("h2-{}", std::process::id());

    let mut i = 1;
    while i < raw.len() {
        match raw[i].as_str() {
            "--child" if i + 1 < raw.len() => {
                child = raw[i + 1].clone();
                i += 2;
            }
            "--arg" if i + 1 < raw.len() => {
                child_args.push(raw[i + 1].clone());
                i += 2;
            }
            "--env" if i + 1 < raw.len() => {
                if let Some((k, v)) = raw[i + 1].split_once('=') {
                    env.push((k.to_string(), v.to_string()));
                }
                i += 2;
            }
            "--cols" if i + 1 < raw.len() => {
                cols = raw[i + 1].parse().unwrap_or(DEFAULT_COLS);
                i += 2;
            }
            "--rows" if i + 1 < raw.len() => {
                rows = raw[i + 1].parse().unwrap_or(DEFAULT_ROWS);
                i += 2;
            }
            "--session-name" if i + 1 < raw.len() => {
                session_name = raw[i + 1].clone();
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    Args {
        child,
        child_args,
        env,
        cols,
        rows,
        session_name,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let cfg = config::ensure_loaded();
    let args = parse_args();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let session = std::sync::Arc::new(
            h2_core::session::Session::start(
                args.session_name.clone(),
                args.child,
                args.child_args,
                args.env,
                args.cols,
                args.rows,
            )
            .await?,
        );
        log::info!(
            "session {} listening for {}",
            session.id,
            args.session_name
        );
        session.serve(&cfg.sockets_dir).await?;
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    })
}
