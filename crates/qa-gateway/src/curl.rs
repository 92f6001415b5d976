//! curl-compatible front end for the gateway. Installers call `curl` with
//! whatever flags they like; only the ones that change request or output
//! shape are honored, the rest are accepted and ignored.

use crate::gateway::{Gateway, Request, Response};
use anyhow::{anyhow, Result};
use std::fs;
use std::path::PathBuf;

/// curl's exit code for HTTP errors under `-f`.
pub const HTTP_ERROR_EXIT: i32 = 22;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurlArgs {
    pub method: Option<String>,
    pub url: Option<String>,
    pub data: Vec<String>,
    pub headers: Vec<String>,
    pub write_out: Option<String>,
    pub output: Option<PathBuf>,
    pub fail: bool,
    pub head: bool,
}

impl CurlArgs {
    pub fn effective_method(&self) -> String {
        if let Some(m) = &self.method {
            return m.to_ascii_uppercase();
        }
        if self.head {
            "HEAD".to_string()
        } else if self.data.is_empty() {
            "GET".to_string()
        } else {
            "POST".to_string()
        }
    }

    /// Request body; repeated data flags are joined with `&` like curl does.
    pub fn body(&self) -> Option<String> {
        if self.data.is_empty() {
            None
        } else {
            Some(self.data.join("&"))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurlOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Long flags that consume the next argument but do not affect the mock.
const IGNORED_LONG_WITH_VALUE: &[&str] = &[
    "--max-time",
    "--connect-timeout",
    "--retry",
    "--retry-delay",
    "--retry-max-time",
    "--user-agent",
    "--user",
    "--cacert",
    "--proto",
    "--tlsv1.2",
    "--limit-rate",
    "--cookie",
    "--referer",
];

/// Short flags that take a value.
const SHORT_WITH_VALUE: &[char] = &['X', 'd', 'H', 'w', 'o', 'u', 'm', 'A', 'e', 'b', 'T'];

/// `@file` reads the file. Text data flags drop its line breaks like curl
/// does; `binary` keeps the bytes as they are.
fn read_data_arg(raw: &str, binary: bool) -> Result<String> {
    match raw.strip_prefix('@') {
        Some("-") => Ok(String::new()),
        Some(path) => fs::read_to_string(path)
            .map(|s| if binary { s } else { s.replace(['\r', '\n'], "") })
            .map_err(|e| anyhow!("curl: can't read data from file '{}': {}", path, e)),
        None => Ok(raw.to_string()),
    }
}

fn apply_value(args: &mut CurlArgs, flag: &str, value: &str) -> Result<()> {
    match flag {
        "-X" | "--request" => args.method = Some(value.to_string()),
        "-d" | "--data" | "--data-ascii" => args.data.push(read_data_arg(value, false)?),
        "--data-binary" | "--json" => args.data.push(read_data_arg(value, true)?),
        "--data-raw" | "--data-urlencode" => args.data.push(value.to_string()),
        "-H" | "--header" => args.headers.push(value.to_string()),
        "-w" | "--write-out" => args.write_out = Some(value.to_string()),
        "-o" | "--output" => args.output = Some(PathBuf::from(value)),
        "--url" => args.url = Some(value.to_string()),
        _ => {}
    }
    Ok(())
}

fn long_takes_value(flag: &str) -> bool {
    matches!(
        flag,
        "--request"
            | "--data"
            | "--data-binary"
            | "--data-ascii"
            | "--data-raw"
            | "--data-urlencode"
            | "--json"
            | "--header"
            | "--write-out"
            | "--output"
            | "--url"
    ) || IGNORED_LONG_WITH_VALUE.contains(&flag)
}

pub fn parse_args(argv: &[String]) -> Result<CurlArgs> {
    let mut args = CurlArgs::default();
    let mut i = 0;
    while i < argv.len() {
        let arg = argv[i].as_str();
        i += 1;
        if let Some(long) = arg.strip_prefix("--") {
            if long.is_empty() {
                continue;
            }
            let (flag, inline) = match arg.split_once('=') {
                Some((f, v)) => (f, Some(v.to_string())),
                None => (arg, None),
            };
            match flag {
                "--fail" | "--fail-with-body" => args.fail = true,
                "--head" => args.head = true,
                _ if long_takes_value(flag) => {
                    let value = match inline {
                        Some(v) => v,
                        None => {
                            let v = argv
                                .get(i)
                                .ok_or_else(|| anyhow!("curl: option {} needs a value", flag))?;
                            i += 1;
                            v.clone()
                        }
                    };
                    apply_value(&mut args, flag, &value)?;
                }
                _ => {}
            }
            continue;
        }
        if let Some(shorts) = arg.strip_prefix('-').filter(|s| !s.is_empty()) {
            let chars: Vec<char> = shorts.chars().collect();
            for (pos, c) in chars.iter().enumerate() {
                if SHORT_WITH_VALUE.contains(c) {
                    let attached: String = chars[pos + 1..].iter().collect();
                    let value = if attached.is_empty() {
                        let v = argv
                            .get(i)
                            .ok_or_else(|| anyhow!("curl: option -{} needs a value", c))?;
                        i += 1;
                        v.clone()
                    } else {
                        attached
                    };
                    apply_value(&mut args, &format!("-{}", c), &value)?;
                    break;
                }
                match c {
                    'f' => args.fail = true,
                    'I' => args.head = true,
                    _ => {}
                }
            }
            continue;
        }
        if args.url.is_none() {
            args.url = Some(arg.to_string());
        }
    }
    Ok(args)
}

fn render_write_out(template: &str, resp: &Response) -> String {
    template
        .replace("%{http_code}", &resp.status.to_string())
        .replace("%{response_code}", &resp.status.to_string())
        .replace("\\n", "\n")
}

/// Run one curl invocation against the gateway.
pub fn run(gateway: &Gateway, argv: &[String]) -> CurlOutput {
    let args = match parse_args(argv) {
        Ok(args) => args,
        Err(e) => {
            return CurlOutput {
                stderr: format!("{}\n", e),
                exit_code: 2,
                ..CurlOutput::default()
            }
        }
    };
    let Some(url) = args.url.clone() else {
        return CurlOutput {
            stderr: "curl: no URL specified\n".to_string(),
            exit_code: 2,
            ..CurlOutput::default()
        };
    };

    let body = args.body();
    let resp = gateway.handle(&Request::new(&args.effective_method(), &url, body.as_deref()));

    let mut out = CurlOutput::default();
    let http_error = resp.status >= 400;
    let suppress_body = args.fail && http_error && !resp.injected;
    if !suppress_body && !args.head {
        match &args.output {
            Some(path) => {
                if let Err(e) = fs::write(path, &resp.body) {
                    out.stderr = format!("curl: (23) failed writing {}: {}\n", path.display(), e);
                    out.exit_code = 23;
                    return out;
                }
            }
            None => out.stdout.push_str(&resp.body),
        }
    }
    if let Some(template) = &args.write_out {
        out.stdout.push_str(&render_write_out(template, &resp));
    }
    if resp.injected || (args.fail && http_error) {
        out.exit_code = HTTP_ERROR_EXIT;
        if args.fail {
            out.stderr = format!(
                "curl: (22) The requested URL returned error: {}\n",
                resp.status
            );
        }
    }
    out
}
