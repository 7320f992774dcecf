//! Parser for the textual route command language.
//!
//! ```text
//! route add    <service> <src> <dst> [weight <w>] [tags "t1,t2"] [opts "k=v k=v"]
//! route del    <service> [<src> [<dst>]]
//! route weight [<service>] <src> weight <w> [tags "t1,t2"]
//! route alias  <alias> <host>
//! ```
//!
//! Parsing is line-oriented; `#` comments and blank lines are skipped.
//! `<src>` is `HOST/PATH` where the host may be empty, a literal, or a
//! glob, and a path starting with `~` is a regular expression. Errors
//! carry the offending line number. Aliases are returned as data; the
//! caller decides what to register.

use crate::error::{ProxyError, Result};
use std::collections::HashMap;

/// A single parsed route command.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteCmd {
    Add {
        service: String,
        host: String,
        path: String,
        url: String,
        weight: Option<f64>,
        tags: Vec<String>,
        opts: HashMap<String, String>,
    },
    Del {
        service: String,
        host: Option<String>,
        path: Option<String>,
        url: Option<String>,
    },
    Weight {
        /// Empty string applies to all services on the route.
        service: String,
        host: String,
        path: String,
        weight: f64,
        tags: Vec<String>,
    },
    Alias {
        alias: String,
        host: String,
    },
}

/// Parses a multi-line route command string.
pub fn parse(text: &str) -> Result<Vec<RouteCmd>> {
    let mut cmds = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        cmds.push(parse_line(line).map_err(|reason| ProxyError::RouteParse { line: lineno, reason })?);
    }
    Ok(cmds)
}

/// Extracts the alias names declared in a command string. The aliases of
/// an unparseable string are an error, not a partial list.
pub fn parse_aliases(text: &str) -> Result<Vec<String>> {
    Ok(parse(text)?
        .into_iter()
        .filter_map(|cmd| match cmd {
            RouteCmd::Alias { alias, .. } => Some(alias),
            _ => None,
        })
        .collect())
}

fn parse_line(line: &str) -> std::result::Result<RouteCmd, String> {
    let tokens = tokenize(line)?;
    if tokens.first().map(String::as_str) != Some("route") {
        return Err(format!("unknown command {:?}", tokens.first().cloned().unwrap_or_default()));
    }
    match tokens.get(1).map(String::as_str) {
        Some("add") => parse_add(&tokens[2..]),
        Some("del") => parse_del(&tokens[2..]),
        Some("weight") => parse_weight(&tokens[2..]),
        Some("alias") => parse_alias(&tokens[2..]),
        Some(other) => Err(format!("unknown route verb {:?}", other)),
        None => Err("missing route verb".to_string()),
    }
}

fn parse_add(args: &[String]) -> std::result::Result<RouteCmd, String> {
    if args.len() < 3 {
        return Err("route add needs service, source and destination".to_string());
    }
    let service = args[0].clone();
    let (host, path) = split_src(&args[1]);
    let url = args[2].clone();

    let mut weight = None;
    let mut tags = Vec::new();
    let mut opts = HashMap::new();

    let mut rest = args[3..].iter();
    while let Some(keyword) = rest.next() {
        let value = rest
            .next()
            .ok_or_else(|| format!("{} clause needs a value", keyword))?;
        match keyword.as_str() {
            "weight" => weight = Some(parse_weight_value(value)?),
            "tags" => tags = parse_tags(value),
            "opts" => opts = parse_opts(value)?,
            other => return Err(format!("unknown clause {:?}", other)),
        }
    }

    Ok(RouteCmd::Add {
        service,
        host,
        path,
        url,
        weight,
        tags,
        opts,
    })
}

fn parse_del(args: &[String]) -> std::result::Result<RouteCmd, String> {
    match args {
        [service] => Ok(RouteCmd::Del {
            service: service.clone(),
            host: None,
            path: None,
            url: None,
        }),
        [service, src] => {
            let (host, path) = split_src(src);
            Ok(RouteCmd::Del {
                service: service.clone(),
                host: Some(host),
                path: Some(path),
                url: None,
            })
        }
        [service, src, url] => {
            let (host, path) = split_src(src);
            Ok(RouteCmd::Del {
                service: service.clone(),
                host: Some(host),
                path: Some(path),
                url: Some(url.clone()),
            })
        }
        _ => Err("route del needs 1 to 3 arguments".to_string()),
    }
}

fn parse_weight(args: &[String]) -> std::result::Result<RouteCmd, String> {
    // Either `route weight <svc> <src> weight <w> ...` or the service-less
    // `route weight <src> weight <w> ...` form.
    let (service, src, rest) = if args.get(1).map(String::as_str) == Some("weight") {
        (String::new(), args.first(), args.get(1..).unwrap_or(&[]))
    } else {
        (
            args.first().cloned().unwrap_or_default(),
            args.get(1),
            args.get(2..).unwrap_or(&[]),
        )
    };
    let src = src.ok_or_else(|| "route weight needs a source".to_string())?;
    let (host, path) = split_src(src);

    let mut weight = None;
    let mut tags = Vec::new();
    let mut rest_iter = rest.iter();
    while let Some(keyword) = rest_iter.next() {
        let value = rest_iter
            .next()
            .ok_or_else(|| format!("{} clause needs a value", keyword))?;
        match keyword.as_str() {
            "weight" => weight = Some(parse_weight_value(value)?),
            "tags" => tags = parse_tags(value),
            other => return Err(format!("unknown clause {:?}", other)),
        }
    }

    let weight = weight.ok_or_else(|| "route weight needs a weight clause".to_string())?;
    Ok(RouteCmd::Weight {
        service,
        host,
        path,
        weight,
        tags,
    })
}

fn parse_alias(args: &[String]) -> std::result::Result<RouteCmd, String> {
    match args {
        [alias, host] => Ok(RouteCmd::Alias {
            alias: alias.clone(),
            host: host.clone(),
        }),
        _ => Err("route alias needs alias and host".to_string()),
    }
}

/// Splits `HOST/PATH` at the first `/` or `~`. A source without either is
/// a bare host with path `/`; a `~` starts a regex path.
fn split_src(src: &str) -> (String, String) {
    match src.find(['/', '~']) {
        Some(idx) => (src[..idx].to_string(), src[idx..].to_string()),
        None => (src.to_string(), "/".to_string()),
    }
}

fn parse_weight_value(s: &str) -> std::result::Result<f64, String> {
    let w: f64 = s
        .parse()
        .map_err(|_| format!("invalid weight {:?}", s))?;
    if !(0.0..=1.0).contains(&w) {
        return Err(format!("weight {} outside [0,1]", w));
    }
    Ok(w)
}

fn parse_tags(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

fn parse_opts(s: &str) -> std::result::Result<HashMap<String, String>, String> {
    let mut opts = HashMap::new();
    for kv in s.split_whitespace() {
        let (k, v) = kv
            .split_once('=')
            .ok_or_else(|| format!("malformed option {:?}", kv))?;
        opts.insert(k.to_string(), v.to_string());
    }
    Ok(opts)
}

/// Splits a line on whitespace, keeping double-quoted strings (which may
/// contain spaces) as single tokens.
fn tokenize(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => {
                if in_quotes {
                    tokens.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quoted string".to_string());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}
