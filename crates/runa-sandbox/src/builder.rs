// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use regex::Regex;

/// Results of the previous sandbox run in the same session, surfaced to the
/// next program as Go globals.
#[derive(Debug, Clone, Default)]
pub struct SandboxGlobals {
    pub last_exit_code: i32,
    pub last_stdout: String,
    pub last_stderr: String,
}

/// A library dependency pinned in the generated go.mod.
#[derive(Debug, Clone)]
pub struct Library {
    pub name: String,
    pub version: String,
}

/// Imports the submitted code may not bring in; the preamble provides gated
/// replacements (`ExecuteCommand`, `Fetch`, …) instead.
const FORBIDDEN_IMPORTS: &[&str] = &["os/exec", "syscall", "net"];

/// Imports the preamble itself needs; merged with the user's set.
const REQUIRED_IMPORTS: &[&str] = &[
    "encoding/binary",
    "encoding/json",
    "io",
    "net/http",
    "strings",
    "unsafe",
];

/// Host-import declarations and safe wrappers prepended to every program.
///
/// Out-buffers use a 4-byte little-endian length prefix written by the host;
/// scalar results come back in the return value.  The `init` hook replaces
/// the default HTTP transport so any client-library network call is routed
/// through the authorization gate and answered with a 403 when the domain is
/// not approved.
const PREAMBLE: &str = r#"
//go:wasmimport env authorize_domain
func hostAuthorizeDomain(ptr, n uint32) uint32

//go:wasmimport env fetch
func hostFetch(mPtr, mLen, uPtr, uLen, bPtr, bLen, outPtr, outCap uint32) int32

//go:wasmimport env shell
func hostShell(cPtr, cLen, iPtr, iLen, outPtr, outCap, errPtr, errCap uint32) int32

//go:wasmimport env summarize
func hostSummarize(pPtr, pLen, tPtr, tLen, outPtr, outCap uint32) int32

//go:wasmimport env read_file
func hostReadFile(pPtr, pLen, from, to, outPtr, outCap uint32) int32

//go:wasmimport env write_file
func hostWriteFile(pPtr, pLen, cPtr, cLen uint32) int32

//go:wasmimport env create_file
func hostCreateFile(pPtr, pLen, cPtr, cLen uint32) int32

//go:wasmimport env remove_file
func hostRemoveFile(pPtr, pLen uint32) int32

//go:wasmimport env remove_dir
func hostRemoveDir(pPtr, pLen uint32) int32

//go:wasmimport env mkdir
func hostMkdir(pPtr, pLen uint32) int32

//go:wasmimport env move
func hostMove(sPtr, sLen, dPtr, dLen uint32) int32

//go:wasmimport env list_files
func hostListFiles(pPtr, pLen, outPtr, outCap uint32) int32

var LastExitCode int = __LAST_EXIT_CODE__
var LastStdout string = __LAST_STDOUT__
var LastStderr string = __LAST_STDERR__

const outBufCap = 1 << 20

func strArg(s string) (uint32, uint32) {
	if len(s) == 0 {
		return 0, 0
	}
	b := []byte(s)
	return uint32(uintptr(unsafe.Pointer(&b[0]))), uint32(len(b))
}

func outBuf(capacity int) ([]byte, uint32, uint32) {
	b := make([]byte, capacity+4)
	return b, uint32(uintptr(unsafe.Pointer(&b[0]))), uint32(len(b))
}

func bufString(b []byte) string {
	n := binary.LittleEndian.Uint32(b[:4])
	if int(n) > len(b)-4 {
		n = uint32(len(b) - 4)
	}
	return string(b[4 : 4+n])
}

// AuthorizeDomain asks the runtime for permission to contact a domain.
// Approvals and denials are remembered for the session.
func AuthorizeDomain(domain string) bool {
	p, n := strArg(domain)
	return hostAuthorizeDomain(p, n) == 1
}

// Fetch performs an HTTP request through the runtime. The domain must be
// approved; unapproved domains answer 403 with the domain in the body.
func Fetch(method, url, body string) (int, string) {
	mp, mn := strArg(method)
	up, un := strArg(url)
	bp, bn := strArg(body)
	buf, op, oc := outBuf(outBufCap)
	status := hostFetch(mp, mn, up, un, bp, bn, op, oc)
	return int(status), bufString(buf)
}

// ExecuteCommand runs a command via the runtime's shell gate.
// Returns exit code, stdout and stderr.
func ExecuteCommand(args ...string) (int, string, string) {
	payload, err := json.Marshal(args)
	if err != nil {
		return -1, "", err.Error()
	}
	cp, cn := strArg(string(payload))
	so, sop, soc := outBuf(outBufCap)
	se, sep, sec := outBuf(outBufCap)
	code := hostShell(cp, cn, 0, 0, sop, soc, sep, sec)
	return int(code), bufString(so), bufString(se)
}

// Summarize condenses text with the runtime's summarization model.
func Summarize(prompt, text string) string {
	pp, pn := strArg(prompt)
	tp, tn := strArg(text)
	buf, op, oc := outBuf(outBufCap)
	if hostSummarize(pp, pn, tp, tn, op, oc) != 0 {
		return ""
	}
	return bufString(buf)
}

// ReadFile returns lines from..to of a file (1-indexed, 0 = whole file).
func ReadFile(path string, from, to int) (string, error) {
	pp, pn := strArg(path)
	buf, op, oc := outBuf(outBufCap)
	rc := hostReadFile(pp, pn, uint32(from), uint32(to), op, oc)
	if rc != 0 {
		return "", errorsNew("read_file failed: " + bufString(buf))
	}
	return bufString(buf), nil
}

func WriteFile(path, content string) error {
	pp, pn := strArg(path)
	cp, cn := strArg(content)
	if hostWriteFile(pp, pn, cp, cn) != 0 {
		return errorsNew("write_file failed (was the file read first?)")
	}
	return nil
}

func CreateFile(path, content string) error {
	pp, pn := strArg(path)
	cp, cn := strArg(content)
	if hostCreateFile(pp, pn, cp, cn) != 0 {
		return errorsNew("create_file failed")
	}
	return nil
}

func RemoveFile(path string) error {
	pp, pn := strArg(path)
	if hostRemoveFile(pp, pn) != 0 {
		return errorsNew("remove_file failed")
	}
	return nil
}

func RemoveDir(path string) error {
	pp, pn := strArg(path)
	if hostRemoveDir(pp, pn) != 0 {
		return errorsNew("remove_dir failed")
	}
	return nil
}

func Mkdir(path string) error {
	pp, pn := strArg(path)
	if hostMkdir(pp, pn) != 0 {
		return errorsNew("mkdir failed")
	}
	return nil
}

func Move(src, dst string) error {
	sp, sn := strArg(src)
	dp, dn := strArg(dst)
	if hostMove(sp, sn, dp, dn) != 0 {
		return errorsNew("move failed")
	}
	return nil
}

func ListFiles(path string) ([]string, error) {
	pp, pn := strArg(path)
	buf, op, oc := outBuf(outBufCap)
	if hostListFiles(pp, pn, op, oc) != 0 {
		return nil, errorsNew("list_files failed")
	}
	out := bufString(buf)
	if out == "" {
		return nil, nil
	}
	return strings.Split(out, "\n"), nil
}

type sandboxError struct{ msg string }

func (e sandboxError) Error() string { return e.msg }

func errorsNew(msg string) error { return sandboxError{msg: msg} }

type authorizedTransport struct{}

// RoundTrip routes every client-library request through the gated Fetch so
// nothing reaches the network without an approved domain.
func (authorizedTransport) RoundTrip(req *http.Request) (*http.Response, error) {
	host := req.URL.Hostname()
	if !AuthorizeDomain(host) {
		return &http.Response{
			StatusCode: 403,
			Status:     "403 Forbidden",
			Body:       io.NopCloser(strings.NewReader("403 Domain not authorized: " + host)),
			Header:     http.Header{},
			Request:    req,
		}, nil
	}
	body := ""
	if req.Body != nil {
		raw, _ := io.ReadAll(req.Body)
		body = string(raw)
	}
	status, respBody := Fetch(req.Method, req.URL.String(), body)
	return &http.Response{
		StatusCode: status,
		Body:       io.NopCloser(strings.NewReader(respBody)),
		Header:     http.Header{},
		Request:    req,
	}, nil
}

func init() {
	http.DefaultTransport = authorizedTransport{}
	http.DefaultClient.Transport = authorizedTransport{}
}
"#;

/// One parsed import line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Import {
    alias: Option<String>,
    path: String,
}

/// Merge the submitted program with the preamble into one compilable
/// `main.go` source.
///
/// The user's `package` clause and import block are stripped and their
/// imports merged with the preamble's required set; forbidden imports are
/// rejected.  Previous-run results are injected as globals.
pub fn assemble_source(user_code: &str, globals: &SandboxGlobals) -> anyhow::Result<String> {
    let (imports, body) = split_imports(user_code)?;

    for import in &imports {
        if FORBIDDEN_IMPORTS.contains(&import.path.as_str()) {
            anyhow::bail!(
                "import \"{}\" is not allowed in the sandbox; use the provided \
                 ExecuteCommand/Fetch helpers instead",
                import.path
            );
        }
    }

    // path → alias; required imports never carry an alias.
    let mut merged: BTreeMap<String, Option<String>> = BTreeMap::new();
    for path in REQUIRED_IMPORTS {
        merged.insert((*path).to_string(), None);
    }
    for import in imports {
        merged.entry(import.path).or_insert(import.alias);
    }

    let import_block = merged
        .iter()
        .map(|(path, alias)| match alias {
            Some(a) => format!("\t{a} \"{path}\""),
            None => format!("\t\"{path}\""),
        })
        .collect::<Vec<_>>()
        .join("\n");

    let preamble = PREAMBLE
        .replace("__LAST_EXIT_CODE__", &globals.last_exit_code.to_string())
        .replace("__LAST_STDOUT__", &go_quote(&globals.last_stdout))
        .replace("__LAST_STDERR__", &go_quote(&globals.last_stderr));

    Ok(format!(
        "package main\n\nimport (\n{import_block}\n)\n{preamble}\n{body}\n"
    ))
}

/// go.mod content pinning the requested libraries.
pub fn go_mod(libraries: &[Library]) -> String {
    let mut out = String::from("module sandbox\n\ngo 1.22\n");
    if !libraries.is_empty() {
        out.push_str("\nrequire (\n");
        for lib in libraries {
            out.push_str(&format!("\t{} {}\n", lib.name, lib.version));
        }
        out.push_str(")\n");
    }
    out
}

/// Strip the package clause and import declarations, returning the imports
/// and the remaining body.
fn split_imports(user_code: &str) -> anyhow::Result<(Vec<Import>, String)> {
    let code = user_code.trim();

    let package_re = Regex::new(r"(?m)^[ \t]*package\s+\w+[ \t]*$").expect("static regex");
    let block_re = Regex::new(r"(?s)import\s*\(\s*(.*?)\s*\)").expect("static regex");
    let single_re =
        Regex::new(r#"(?m)^[ \t]*import\s+(?:(\w+|\.)\s+)?"([^"]+)"[ \t]*$"#).expect("static regex");
    let line_re =
        Regex::new(r#"^(?:(\w+|\.)\s+)?"([^"]+)"$"#).expect("static regex");

    let mut imports: Vec<Import> = Vec::new();

    let mut body = package_re.replace_all(code, "").into_owned();

    if let Some(captures) = block_re.captures(&body) {
        for raw in captures
            .get(1)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .lines()
        {
            let raw = raw.trim().trim_end_matches(';');
            if raw.is_empty() || raw.starts_with("//") {
                continue;
            }
            let Some(c) = line_re.captures(raw) else {
                anyhow::bail!("unparseable import line: {raw}");
            };
            imports.push(Import {
                alias: c.get(1).map(|m| m.as_str().to_string()),
                path: c[2].to_string(),
            });
        }
        body = block_re.replace(&body, "").into_owned();
    }

    for c in single_re.captures_iter(&body.clone()) {
        imports.push(Import {
            alias: c.get(1).map(|m| m.as_str().to_string()),
            path: c[2].to_string(),
        });
    }
    body = single_re.replace_all(&body, "").into_owned();

    Ok((imports, body.trim().to_string()))
}

/// Quote a string as a Go double-quoted literal.
fn go_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (' '..='~').contains(&c) => out.push(c),
            c if (c as u32) <= 0xFFFF => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => {
                out.push_str(&format!("\\U{:08x}", c as u32));
            }
        }
    }
    out.push('"');
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
