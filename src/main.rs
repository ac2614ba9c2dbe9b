mod broadsheet;
mod db;
mod grading;
mod ipc;
mod logging;
mod matrix;
mod model;
mod ranking;
mod repo;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

fn main() {
    if let Err(e) = logging::init() {
        eprintln!("resultsd: logging disabled: {}", e);
    }

    let mut state = ipc::AppState::new();
    if let Some(path) = std::env::var_os("RESULTSD_WORKSPACE").map(PathBuf::from) {
        if let Err(e) = ipc::select_workspace(&mut state, &path) {
            warn!(workspace = %path.to_string_lossy(), error = %e, "startup workspace not opened");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to reply to.
                let resp = ipc::err("", "bad_json", e.to_string(), None);
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        debug!(id = %req.id, method = %req.method, "request");
        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
