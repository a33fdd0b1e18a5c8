#![allow(dead_code)]

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::oneshot;

/// A throwaway executable standing in for the CLI under test.
pub struct FakeCli {
    _temp_dir: TempDir,
    bin_path: PathBuf,
}

impl FakeCli {
    pub fn new(name: &str, stdout: &str, stderr: &str, exit_code: i32) -> io::Result<Self> {
        Self::new_script(name, &render_script(stdout, stderr, exit_code))
    }

    pub fn new_script(name: &str, script: &str) -> io::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let bin_path = temp_dir.path().join(name);
        fs::write(&bin_path, script)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&bin_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&bin_path, perms)?;
        }

        Ok(Self {
            _temp_dir: temp_dir,
            bin_path,
        })
    }

    /// A CLI that asks for a name on stdout, then greets on stderr.
    pub fn greeter(name: &str) -> io::Result<Self> {
        Self::new_script(
            name,
            "#!/bin/sh\nprintf 'Enter name: '\nread name\necho \"Hello $name\" 1>&2\nexit 0\n",
        )
    }

    /// A CLI that walks through a deploy flow: a confirmation prompt, build
    /// progress, and the deployment URL.
    pub fn deployer(name: &str, url: &str) -> io::Result<Self> {
        Self::new_script(
            name,
            &format!(
                "#!/bin/sh\n\
                 printf '? Set up and deploy \"~/app\"? [Y/n] '\n\
                 read answer\n\
                 if [ \"$answer\" != \"y\" ]; then echo 'Aborted' 1>&2; exit 1; fi\n\
                 echo 'Uploading [====================] 100%' 1>&2\n\
                 echo 'Building...' 1>&2\n\
                 echo '{url}'\n\
                 printf '\\033[32mProduction: %s\\033[39m [2s]\\n' '{url}' 1>&2\n\
                 exit 0\n"
            ),
        )
    }

    pub fn bin_path(&self) -> &Path {
        &self.bin_path
    }
}

fn render_script(stdout: &str, stderr: &str, exit_code: i32) -> String {
    format!(
        "#!/bin/sh\ncat <<'STDOUT'\n{stdout}\nSTDOUT\ncat <<'STDERR' 1>&2\n{stderr}\nSTDERR\nexit {exit_code}\n"
    )
}

#[derive(Default)]
struct BackendState {
    routes: Mutex<HashMap<String, VecDeque<(u16, String)>>>,
    hits: Mutex<HashMap<String, usize>>,
    authorization: Mutex<Vec<String>>,
}

/// An HTTP backend serving scripted responses per path. Each request pops
/// the next response; the last one repeats once the script runs out.
pub struct FakeBackend {
    addr: SocketAddr,
    state: Arc<BackendState>,
    _shutdown: oneshot::Sender<()>,
}

impl FakeBackend {
    pub async fn start() -> io::Result<Self> {
        let state = Arc::new(BackendState::default());
        let app = Router::new()
            .fallback(scripted_handler)
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        Ok(Self {
            addr,
            state,
            _shutdown: shutdown_tx,
        })
    }

    pub fn script<I, S>(&self, path: &str, responses: I)
    where
        I: IntoIterator<Item = (u16, S)>,
        S: Into<String>,
    {
        let responses = responses
            .into_iter()
            .map(|(status, body)| (status, body.into()))
            .collect();
        self.state
            .routes
            .lock()
            .unwrap()
            .insert(path.to_string(), responses);
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn authorization_headers(&self) -> Vec<String> {
        self.state.authorization.lock().unwrap().clone()
    }
}

async fn scripted_handler(
    State(state): State<Arc<BackendState>>,
    uri: Uri,
    headers: HeaderMap,
) -> (StatusCode, String) {
    let path = uri.path().to_string();
    *state.hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;
    if let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        state.authorization.lock().unwrap().push(value.to_string());
    }

    let mut routes = state.routes.lock().unwrap();
    let Some(queue) = routes.get_mut(&path) else {
        return (StatusCode::NOT_FOUND, format!("no route for {}", path));
    };
    let (status, body) = if queue.len() > 1 {
        queue.pop_front().unwrap()
    } else {
        queue.front().cloned().unwrap_or((404, String::new()))
    };
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body,
    )
}
