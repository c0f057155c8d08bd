// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};
use wasmtime::{Caller, Linker, Memory};
use wasmtime_wasi::preview1::WasiP1Ctx;

use runa_model::ModelProvider;
use runa_session::{Authorizer, Session};

use crate::deadline::PausableDeadline;

/// WASI errnos for the defensive socket stubs.
const ERRNO_PROTONOSUPPORT: i32 = 66;
const ERRNO_PERM: i32 = 63;

/// Per-instantiation store data: the WASI context plus the capability
/// handles host imports act through.
pub struct HostState {
    pub wasi: WasiP1Ctx,
    pub host: Arc<SandboxHost>,
}

/// Capabilities shared by all host imports of one sandbox run.
///
/// Everything that can block on the network or on a human goes through
/// `handle.block_on` — the module itself runs on a blocking thread, so the
/// host imports are free to wait.
pub struct SandboxHost {
    pub session: Arc<Session>,
    pub authorizer: Arc<Authorizer>,
    pub summarizer: Arc<dyn ModelProvider>,
    pub deadline: Arc<PausableDeadline>,
    pub handle: tokio::runtime::Handle,
    pub http: reqwest::Client,
    pub fetch_body_cap: usize,
    pub shell_timeout: Duration,
    pub workdir: PathBuf,
    /// Domains the user already refused; asked once, answered 403 forever
    /// after within the run.
    pub denied_domains: Mutex<HashSet<String>>,
}

impl SandboxHost {
    /// Session grant → allowed.  Cached denial → refused without a prompt.
    /// Otherwise prompt the user, with the execution deadline paused while
    /// the prompt is pending.
    pub fn authorize_domain_blocking(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        if self.session.domain_authorized(&domain) {
            return true;
        }
        if self
            .denied_domains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&domain)
        {
            return false;
        }

        self.deadline.pause();
        let decision = self
            .handle
            .block_on(self.authorizer.authorize_domain(&domain));
        self.deadline.resume();

        if !decision.allowed {
            self.denied_domains
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(domain.clone());
            debug!(domain, reason = %decision.reason, "sandbox domain refused");
        }
        decision.allowed
    }

    /// HTTP request for an already-approved domain.  Unapproved domains get
    /// a 403 whose body names the domain.
    pub fn fetch_blocking(&self, method: &str, url: &str, body: &str) -> (i32, Vec<u8>) {
        let Some(domain) = host_of(url) else {
            return (-1, format!("cannot parse URL: {url}").into_bytes());
        };
        if !self.session.domain_authorized(&domain) {
            return (
                403,
                format!("403 Domain not authorized: {domain}").into_bytes(),
            );
        }

        let method = match method.parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(_) => return (-1, format!("invalid HTTP method: {method}").into_bytes()),
        };
        let request = self.http.request(method, url);
        let request = if body.is_empty() {
            request
        } else {
            request.body(body.to_string())
        };

        match self.handle.block_on(async {
            let resp = request.send().await?;
            let status = resp.status().as_u16();
            let bytes = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, bytes))
        }) {
            Ok((status, bytes)) => {
                let mut data = bytes.to_vec();
                data.truncate(self.fetch_body_cap);
                (status as i32, data)
            }
            Err(e) => (-1, format!("fetch error: {e}").into_bytes()),
        }
    }

    /// Run `[bin, arg…]` (JSON array) through the command gate.
    /// Returns (exit_code, stdout, stderr).
    pub fn shell_blocking(&self, cmd_json: &str, stdin: &str) -> (i32, Vec<u8>, Vec<u8>) {
        let argv: Vec<String> = match serde_json::from_str(cmd_json) {
            Ok(v) => v,
            Err(e) => {
                return (
                    -1,
                    Vec::new(),
                    format!("command must be a JSON array: {e}").into_bytes(),
                )
            }
        };
        let Some((bin, args)) = argv.split_first() else {
            return (-1, Vec::new(), b"empty command".to_vec());
        };

        let rendered = argv.join(" ");
        self.deadline.pause();
        let decision = self
            .handle
            .block_on(self.authorizer.authorize_command(&rendered));
        self.deadline.resume();
        if !decision.allowed {
            return (126, Vec::new(), decision.reason.into_bytes());
        }

        let bin = bin.clone();
        let args = args.to_vec();
        let stdin = stdin.to_string();
        let workdir = self.workdir.clone();
        let timeout = self.shell_timeout;
        let result = self.handle.block_on(async move {
            use std::process::Stdio;
            use tokio::io::AsyncWriteExt;

            let mut cmd = tokio::process::Command::new(&bin);
            cmd.args(&args)
                .current_dir(&workdir)
                .stdin(if stdin.is_empty() {
                    Stdio::null()
                } else {
                    Stdio::piped()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            let mut child = cmd.spawn()?;
            if !stdin.is_empty() {
                if let Some(mut pipe) = child.stdin.take() {
                    let _ = pipe.write_all(stdin.as_bytes()).await;
                }
            }
            tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "command timed out"))?
        });

        match result {
            Ok(output) => (
                output.status.code().unwrap_or(-1),
                output.stdout,
                output.stderr,
            ),
            Err(e) => (-1, Vec::new(), format!("spawn error: {e}").into_bytes()),
        }
    }

    pub fn summarize_blocking(&self, prompt: &str, text: &str) -> Option<String> {
        self.deadline.pause();
        let out = self
            .handle
            .block_on(self.summarizer.complete_prompt(&format!("{prompt}\n\n{text}")));
        self.deadline.resume();
        match out {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "sandbox summarize failed");
                None
            }
        }
    }

    // ── Filesystem bridges (same semantics as the top-level tools) ──────────

    /// Route a filesystem mutation through the authorizer before it touches
    /// disk, pausing the execution deadline while a prompt is pending.
    fn authorize_mutation(&self, action: &str) -> Result<(), String> {
        self.deadline.pause();
        let decision = self.handle.block_on(
            self.authorizer
                .authorize_action(runa_session::ACTION_FILE_MUTATION, action),
        );
        self.deadline.resume();
        if decision.allowed {
            Ok(())
        } else {
            Err(decision.reason)
        }
    }

    pub fn read_file_blocking(&self, path: &str, from: u32, to: u32) -> Result<String, String> {
        let resolved = self.session.resolve_path(path).map_err(|e| e.to_string())?;
        let content = std::fs::read_to_string(&resolved)
            .map_err(|e| format!("read error: {path}: {e}"))?;
        self.session.track_file_read(resolved, content.clone());

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let from = if from == 0 { 1 } else { from as usize };
        let to = if to == 0 { total } else { to as usize };
        if total == 0 {
            return Ok(String::new());
        }
        if from > total {
            return Err(format!("from line {from} is beyond the end ({total} lines)"));
        }
        Ok(lines[from - 1..to.min(total)].join("\n"))
    }

    fn mutation_allowed(&self, resolved: &std::path::Path) -> Result<(), String> {
        if resolved.exists() && !self.session.was_read(resolved) {
            return Err(format!(
                "read-required: {} was never read in this session",
                resolved.display()
            ));
        }
        Ok(())
    }

    pub fn write_file_blocking(&self, path: &str, content: &str) -> Result<(), String> {
        let resolved = self.session.resolve_path(path).map_err(|e| e.to_string())?;
        self.authorize_mutation(&format!("modify files in the workspace (write {path})"))?;
        self.mutation_allowed(&resolved)?;
        std::fs::write(&resolved, content).map_err(|e| e.to_string())?;
        self.session.track_file_modified(resolved.clone());
        self.session.track_file_read(resolved, content);
        Ok(())
    }

    pub fn create_file_blocking(&self, path: &str, content: &str) -> Result<(), String> {
        let resolved = self.session.resolve_path(path).map_err(|e| e.to_string())?;
        self.authorize_mutation(&format!("modify files in the workspace (create {path})"))?;
        if resolved.exists() {
            return Err(format!("{path} already exists"));
        }
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&resolved, content).map_err(|e| e.to_string())?;
        self.session.track_file_modified(resolved.clone());
        self.session.track_file_read(resolved, content);
        Ok(())
    }

    pub fn remove_file_blocking(&self, path: &str) -> Result<(), String> {
        let resolved = self.session.resolve_path(path).map_err(|e| e.to_string())?;
        self.authorize_mutation(&format!("modify files in the workspace (remove {path})"))?;
        if !resolved.exists() {
            return Err(format!("{path} does not exist"));
        }
        self.mutation_allowed(&resolved)?;
        std::fs::remove_file(&resolved).map_err(|e| e.to_string())?;
        self.session.track_file_modified(resolved);
        Ok(())
    }

    pub fn remove_dir_blocking(&self, path: &str) -> Result<(), String> {
        let resolved = self.session.resolve_path(path).map_err(|e| e.to_string())?;
        self.authorize_mutation(&format!("modify files in the workspace (remove dir {path})"))?;
        if !resolved.is_dir() {
            return Err(format!("{path} is not a directory"));
        }
        // Listing a directory is its read; an unlisted directory may not be
        // deleted, same as an unread file.
        self.mutation_allowed(&resolved)?;
        std::fs::remove_dir_all(&resolved).map_err(|e| e.to_string())?;
        self.session.track_file_modified(resolved);
        Ok(())
    }

    pub fn mkdir_blocking(&self, path: &str) -> Result<(), String> {
        let resolved = self.session.resolve_path(path).map_err(|e| e.to_string())?;
        self.authorize_mutation(&format!("modify files in the workspace (mkdir {path})"))?;
        std::fs::create_dir_all(&resolved).map_err(|e| e.to_string())?;
        self.session.track_file_modified(resolved);
        Ok(())
    }

    pub fn move_blocking(&self, src: &str, dst: &str) -> Result<(), String> {
        let s = self.session.resolve_path(src).map_err(|e| e.to_string())?;
        let d = self.session.resolve_path(dst).map_err(|e| e.to_string())?;
        self.authorize_mutation(&format!("modify files in the workspace (move {src} to {dst})"))?;
        if !s.exists() {
            return Err(format!("{src} does not exist"));
        }
        if s.is_file() {
            self.mutation_allowed(&s)?;
        }
        self.mutation_allowed(&d)?;
        std::fs::rename(&s, &d).map_err(|e| e.to_string())?;
        self.session.track_file_modified(s);
        self.session.track_file_modified(d);
        Ok(())
    }

    pub fn list_files_blocking(&self, path: &str) -> Result<String, String> {
        let resolved = self.session.resolve_path(path).map_err(|e| e.to_string())?;
        let entries = std::fs::read_dir(&resolved).map_err(|e| e.to_string())?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| {
                let mut name = e.file_name().to_string_lossy().into_owned();
                if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                name
            })
            .collect();
        names.sort();
        let listing = names.join("\n");
        // A listing is the directory analogue of a file read; it unlocks
        // remove_dir for this path.
        self.session.track_file_read(resolved, listing.clone());
        Ok(listing)
    }
}

/// Extract the host from a URL.
fn host_of(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1)?;
    let host_port = rest.split(['/', '?', '#']).next()?;
    let host = host_port.rsplit('@').next()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

// ─── Memory helpers ───────────────────────────────────────────────────────────

fn memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    match caller.get_export("memory") {
        Some(wasmtime::Extern::Memory(m)) => Some(m),
        _ => None,
    }
}

fn read_str(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> Option<String> {
    if len == 0 {
        return Some(String::new());
    }
    let mem = memory(caller)?;
    let mut buf = vec![0u8; len as usize];
    mem.read(&mut *caller, ptr as usize, &mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Write `data` into an out-buffer as a 4-byte LE length prefix plus
/// payload, clipped to the buffer capacity.
fn write_out(caller: &mut Caller<'_, HostState>, ptr: u32, cap: u32, data: &[u8]) {
    if cap < 4 {
        return;
    }
    let Some(mem) = memory(caller) else {
        return;
    };
    let n = data.len().min((cap - 4) as usize);
    let _ = mem.write(&mut *caller, ptr as usize, &(n as u32).to_le_bytes());
    let _ = mem.write(&mut *caller, ptr as usize + 4, &data[..n]);
}

fn result_to_code(
    caller: &mut Caller<'_, HostState>,
    out_ptr: u32,
    out_cap: u32,
    result: Result<(), String>,
) -> i32 {
    match result {
        Ok(()) => 0,
        Err(msg) => {
            write_out(caller, out_ptr, out_cap, msg.as_bytes());
            -1
        }
    }
}

/// Wire every `env` host import plus the defensive socket stubs.
pub fn add_host_imports(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "authorize_domain",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> u32 {
            let Some(domain) = read_str(&mut caller, ptr, len) else {
                return 0;
            };
            let host = Arc::clone(&caller.data().host);
            u32::from(host.authorize_domain_blocking(&domain))
        },
    )?;

    linker.func_wrap(
        "env",
        "fetch",
        |mut caller: Caller<'_, HostState>,
         m_ptr: u32,
         m_len: u32,
         u_ptr: u32,
         u_len: u32,
         b_ptr: u32,
         b_len: u32,
         out_ptr: u32,
         out_cap: u32|
         -> i32 {
            let (Some(method), Some(url), Some(body)) = (
                read_str(&mut caller, m_ptr, m_len),
                read_str(&mut caller, u_ptr, u_len),
                read_str(&mut caller, b_ptr, b_len),
            ) else {
                return -1;
            };
            let host = Arc::clone(&caller.data().host);
            let (status, data) = host.fetch_blocking(&method, &url, &body);
            write_out(&mut caller, out_ptr, out_cap, &data);
            status
        },
    )?;

    linker.func_wrap(
        "env",
        "shell",
        |mut caller: Caller<'_, HostState>,
         c_ptr: u32,
         c_len: u32,
         i_ptr: u32,
         i_len: u32,
         out_ptr: u32,
         out_cap: u32,
         err_ptr: u32,
         err_cap: u32|
         -> i32 {
            let (Some(cmd_json), Some(stdin)) = (
                read_str(&mut caller, c_ptr, c_len),
                read_str(&mut caller, i_ptr, i_len),
            ) else {
                return -1;
            };
            let host = Arc::clone(&caller.data().host);
            let (code, stdout, stderr) = host.shell_blocking(&cmd_json, &stdin);
            write_out(&mut caller, out_ptr, out_cap, &stdout);
            write_out(&mut caller, err_ptr, err_cap, &stderr);
            code
        },
    )?;

    linker.func_wrap(
        "env",
        "summarize",
        |mut caller: Caller<'_, HostState>,
         p_ptr: u32,
         p_len: u32,
         t_ptr: u32,
         t_len: u32,
         out_ptr: u32,
         out_cap: u32|
         -> i32 {
            let (Some(prompt), Some(text)) = (
                read_str(&mut caller, p_ptr, p_len),
                read_str(&mut caller, t_ptr, t_len),
            ) else {
                return -1;
            };
            let host = Arc::clone(&caller.data().host);
            match host.summarize_blocking(&prompt, &text) {
                Some(summary) => {
                    write_out(&mut caller, out_ptr, out_cap, summary.as_bytes());
                    0
                }
                None => -1,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "read_file",
        |mut caller: Caller<'_, HostState>,
         p_ptr: u32,
         p_len: u32,
         from: u32,
         to: u32,
         out_ptr: u32,
         out_cap: u32|
         -> i32 {
            let Some(path) = read_str(&mut caller, p_ptr, p_len) else {
                return -1;
            };
            let host = Arc::clone(&caller.data().host);
            match host.read_file_blocking(&path, from, to) {
                Ok(content) => {
                    write_out(&mut caller, out_ptr, out_cap, content.as_bytes());
                    0
                }
                Err(msg) => {
                    write_out(&mut caller, out_ptr, out_cap, msg.as_bytes());
                    -1
                }
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "write_file",
        |mut caller: Caller<'_, HostState>, p_ptr: u32, p_len: u32, c_ptr: u32, c_len: u32| -> i32 {
            let (Some(path), Some(content)) = (
                read_str(&mut caller, p_ptr, p_len),
                read_str(&mut caller, c_ptr, c_len),
            ) else {
                return -1;
            };
            let host = Arc::clone(&caller.data().host);
            let result = host.write_file_blocking(&path, &content);
            result_to_code(&mut caller, 0, 0, result)
        },
    )?;

    linker.func_wrap(
        "env",
        "create_file",
        |mut caller: Caller<'_, HostState>, p_ptr: u32, p_len: u32, c_ptr: u32, c_len: u32| -> i32 {
            let (Some(path), Some(content)) = (
                read_str(&mut caller, p_ptr, p_len),
                read_str(&mut caller, c_ptr, c_len),
            ) else {
                return -1;
            };
            let host = Arc::clone(&caller.data().host);
            let result = host.create_file_blocking(&path, &content);
            result_to_code(&mut caller, 0, 0, result)
        },
    )?;

    linker.func_wrap(
        "env",
        "remove_file",
        |mut caller: Caller<'_, HostState>, p_ptr: u32, p_len: u32| -> i32 {
            let Some(path) = read_str(&mut caller, p_ptr, p_len) else {
                return -1;
            };
            let host = Arc::clone(&caller.data().host);
            let result = host.remove_file_blocking(&path);
            result_to_code(&mut caller, 0, 0, result)
        },
    )?;

    linker.func_wrap(
        "env",
        "remove_dir",
        |mut caller: Caller<'_, HostState>, p_ptr: u32, p_len: u32| -> i32 {
            let Some(path) = read_str(&mut caller, p_ptr, p_len) else {
                return -1;
            };
            let host = Arc::clone(&caller.data().host);
            let result = host.remove_dir_blocking(&path);
            result_to_code(&mut caller, 0, 0, result)
        },
    )?;

    linker.func_wrap(
        "env",
        "mkdir",
        |mut caller: Caller<'_, HostState>, p_ptr: u32, p_len: u32| -> i32 {
            let Some(path) = read_str(&mut caller, p_ptr, p_len) else {
                return -1;
            };
            let host = Arc::clone(&caller.data().host);
            let result = host.mkdir_blocking(&path);
            result_to_code(&mut caller, 0, 0, result)
        },
    )?;

    linker.func_wrap(
        "env",
        "move",
        |mut caller: Caller<'_, HostState>, s_ptr: u32, s_len: u32, d_ptr: u32, d_len: u32| -> i32 {
            let (Some(src), Some(dst)) = (
                read_str(&mut caller, s_ptr, s_len),
                read_str(&mut caller, d_ptr, d_len),
            ) else {
                return -1;
            };
            let host = Arc::clone(&caller.data().host);
            let result = host.move_blocking(&src, &dst);
            result_to_code(&mut caller, 0, 0, result)
        },
    )?;

    linker.func_wrap(
        "env",
        "list_files",
        |mut caller: Caller<'_, HostState>, p_ptr: u32, p_len: u32, out_ptr: u32, out_cap: u32| -> i32 {
            let Some(path) = read_str(&mut caller, p_ptr, p_len) else {
                return -1;
            };
            let host = Arc::clone(&caller.data().host);
            match host.list_files_blocking(&path) {
                Ok(listing) => {
                    write_out(&mut caller, out_ptr, out_cap, listing.as_bytes());
                    0
                }
                Err(msg) => {
                    write_out(&mut caller, out_ptr, out_cap, msg.as_bytes());
                    -1
                }
            }
        },
    )?;

    // Belt-and-braces: if the WASI runtime ever exposes raw sockets, the
    // sandbox answers with hard errnos instead of a connection.
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "sock_open",
        |_caller: Caller<'_, HostState>, _family: i32, _ty: i32, _fd_out: i32| -> i32 {
            ERRNO_PROTONOSUPPORT
        },
    )?;
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "sock_connect",
        |_caller: Caller<'_, HostState>, _fd: i32, _addr: i32, _port: i32| -> i32 { ERRNO_PERM },
    )?;

    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_model::ScriptedProvider;
    use runa_session::ScriptedInteraction;

    fn host_in(dir: &std::path::Path, answers: Vec<&str>) -> Arc<SandboxHost> {
        let session = Arc::new(Session::new(dir));
        let ui = Arc::new(ScriptedInteraction::new(
            answers.into_iter().map(String::from).collect(),
        ));
        let authorizer = Arc::new(Authorizer::new(Arc::clone(&session), ui));
        Arc::new(SandboxHost {
            session,
            authorizer,
            summarizer: Arc::new(ScriptedProvider::new(vec![])),
            deadline: PausableDeadline::new(Duration::from_secs(30), Duration::from_millis(100)),
            handle: tokio::runtime::Handle::current(),
            http: reqwest::Client::new(),
            fetch_body_cap: 1024 * 1024,
            shell_timeout: Duration::from_secs(5),
            workdir: dir.to_path_buf(),
            denied_domains: Mutex::new(HashSet::new()),
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn denied_domain_is_cached_and_not_reprompted() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_in(dir.path(), vec!["deny"]);
        let host2 = Arc::clone(&host);
        // Host calls block; run them off the async thread like the sandbox does.
        let allowed = tokio::task::spawn_blocking(move || {
            let first = host2.authorize_domain_blocking("forbidden.example.com");
            // Second call must not consume another scripted answer (there is
            // none left) — the cached denial answers it.
            let second = host2.authorize_domain_blocking("forbidden.example.com");
            (first, second)
        })
        .await
        .unwrap();
        assert_eq!(allowed, (false, false));
        assert!(!host.deadline.expired());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_to_unapproved_domain_is_403_with_domain_in_body() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_in(dir.path(), vec![]);
        let (status, body) = tokio::task::spawn_blocking(move || {
            host.fetch_blocking("GET", "https://forbidden.example.com/x", "")
        })
        .await
        .unwrap();
        assert_eq!(status, 403);
        assert!(String::from_utf8_lossy(&body).contains("forbidden.example.com"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shell_requires_json_array_and_authorization() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_in(dir.path(), vec!["allow for session"]);
        let host2 = Arc::clone(&host);
        let (bad, ok) = tokio::task::spawn_blocking(move || {
            let bad = host2.shell_blocking("not json", "");
            let ok = host2.shell_blocking("[\"echo\",\"hi\"]", "");
            (bad, ok)
        })
        .await
        .unwrap();
        assert_eq!(bad.0, -1);
        assert_eq!(ok.0, 0);
        assert_eq!(String::from_utf8_lossy(&ok.1).trim(), "hi");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn denied_shell_returns_126_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_in(dir.path(), vec!["deny"]);
        let out = tokio::task::spawn_blocking(move || host.shell_blocking("[\"rm\",\"-rf\",\"/\"]", ""))
            .await
            .unwrap();
        assert_eq!(out.0, 126);
        assert!(String::from_utf8_lossy(&out.2).contains("denied"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fs_bridges_enforce_read_before_write() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        // One mutation approval covers the whole run at session scope.
        let host = host_in(dir.path(), vec!["allow for session"]);
        let host2 = Arc::clone(&host);
        tokio::task::spawn_blocking(move || {
            // Unread existing file: write refused even though it is authorized.
            let err = host2.write_file_blocking("a.txt", "new").unwrap_err();
            assert!(err.contains("read-required"));
            // Read unlocks it and registers the read-set entry.
            let content = host2.read_file_blocking("a.txt", 0, 0).unwrap();
            assert_eq!(content, "one\ntwo");
            host2.write_file_blocking("a.txt", "new").unwrap();
            // New files need no read (and no further prompt).
            host2.create_file_blocking("fresh.txt", "x").unwrap();
            // Escape attempts are rejected.
            assert!(host2.write_file_blocking("../escape.txt", "x").is_err());
        })
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "new"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unapproved_fs_mutation_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        // No scripted answers: the prompt fails and the mutation is refused
        // before anything touches disk.
        let host = host_in(dir.path(), vec![]);
        let err = tokio::task::spawn_blocking(move || {
            host.write_file_blocking("brand-new.txt", "x").unwrap_err()
        })
        .await
        .unwrap();
        assert!(err.contains("approval"), "{err}");
        assert!(!dir.path().join("brand-new.txt").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_dir_requires_a_prior_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("scratch")).unwrap();
        std::fs::write(dir.path().join("scratch/f.txt"), "x").unwrap();
        let host = host_in(dir.path(), vec!["allow for session"]);
        let host2 = Arc::clone(&host);
        tokio::task::spawn_blocking(move || {
            // An unlisted directory may not be deleted.
            let err = host2.remove_dir_blocking("scratch").unwrap_err();
            assert!(err.contains("read-required"), "{err}");
            // Listing it counts as the read and unlocks the delete.
            host2.list_files_blocking("scratch").unwrap();
            host2.remove_dir_blocking("scratch").unwrap();
        })
        .await
        .unwrap();
        assert!(!dir.path().join("scratch").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn list_files_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        let host = host_in(dir.path(), vec![]);
        let listing = tokio::task::spawn_blocking(move || host.list_files_blocking(".").unwrap())
            .await
            .unwrap();
        assert_eq!(listing, "f.txt\nsub/");
    }

    #[test]
    fn host_of_parses_urls() {
        assert_eq!(host_of("https://api.example.com/v1"), Some("api.example.com".into()));
        assert_eq!(host_of("http://Host:8080/x"), Some("host".into()));
        assert_eq!(host_of("garbage"), None);
    }
}
