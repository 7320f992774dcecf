//! Compiled routing table with host/path matching and weighted balancing.
//!
//! Tables are immutable snapshots: the config watcher builds a new table
//! from route commands and publishes it with an atomic pointer swap.
//! Readers load the pointer once per request and keep the snapshot alive
//! for the request's lifetime.

use crate::config::{Matcher, Strategy};
use crate::error::{ProxyError, Result};
use crate::glob::GlobCache;
use crate::parser::RouteCmd;
use arc_swap::ArcSwap;
use http::Uri;
use rand::Rng;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Slots in the weighted selection wheel.
pub const WHEEL_SIZE: usize = 100;

/// URL schemes a target may carry.
const VALID_SCHEMES: [&str; 6] = ["http", "https", "tcp", "grpc", "grpcs", "file"];

/// A single backend endpoint of a route.
///
/// Immutable after table construction; weight changes produce a new table.
#[derive(Debug, Clone)]
pub struct Target {
    pub service: String,
    pub url: Uri,
    pub tags: Vec<String>,
    pub opts: HashMap<String, String>,
    /// Weight from an explicit `weight` clause, before distribution.
    pub fixed_weight: Option<f64>,
    /// Effective weight after distributing unassigned weight.
    pub weight: f64,
    /// Metrics handle for the per-target request timer.
    pub timer_name: String,
}

impl Target {
    /// Protocol used for dispatch: `opts["proto"]` overrides the URL scheme.
    pub fn proto(&self) -> &str {
        self.opts
            .get("proto")
            .map(String::as_str)
            .unwrap_or_else(|| self.url.scheme_str().unwrap_or(""))
    }

    /// True when every one of the target's tags appears in `req_tags`.
    /// Tag-less targets are wildcards and match any request.
    fn eligible(&self, req_tags: &HashSet<&str>) -> bool {
        self.tags.is_empty() || self.tags.iter().all(|t| req_tags.contains(t.as_str()))
    }
}

/// A `(host, path)` rule with its ordered targets and selection wheel.
#[derive(Debug)]
pub struct Route {
    pub host: String,
    pub path: String,
    pub targets: Vec<Arc<Target>>,
    /// Slot -> target index; realizes weights to a 1/WHEEL_SIZE quantum.
    wheel: Vec<u16>,
    /// Compiled pattern for `~`-prefixed regex paths.
    path_regex: Option<Regex>,
    /// Lowercased path for the case-insensitive matcher.
    path_lower: String,
    rr: AtomicUsize,
}

impl Route {
    fn matches_path(
        &self,
        path: &str,
        matcher: Matcher,
        glob: &GlobCache,
        glob_disabled: bool,
    ) -> bool {
        if let Some(re) = &self.path_regex {
            return re.is_match(path);
        }
        match matcher {
            Matcher::Prefix => path.starts_with(&self.path),
            Matcher::IPrefix => path
                .get(..self.path.len())
                .is_some_and(|p| p.eq_ignore_ascii_case(&self.path_lower)),
            Matcher::Glob => {
                if glob_disabled {
                    path.starts_with(&self.path)
                } else {
                    glob.matches(&self.path, path)
                }
            }
        }
    }

    /// Selects a target, honoring the request tag filter.
    ///
    /// Returns `None` when the filter leaves no eligible target, in which
    /// case the caller moves on to the next, less specific route.
    fn pick(&self, req_tags: Option<&HashSet<&str>>, strategy: Strategy) -> Option<Arc<Target>> {
        if self.targets.is_empty() || self.wheel.is_empty() {
            return None;
        }

        match req_tags {
            None => Some(self.pick_wheel(strategy)),
            Some(tags) => {
                let eligible: Vec<&Arc<Target>> =
                    self.targets.iter().filter(|t| t.eligible(tags)).collect();
                if eligible.is_empty() {
                    return None;
                }
                if eligible.len() == self.targets.len() {
                    return Some(self.pick_wheel(strategy));
                }
                // Filtered subset: weighted draw without rebuilding a wheel.
                Some(Self::pick_filtered(&eligible, &self.rr, strategy))
            }
        }
    }

    fn pick_wheel(&self, strategy: Strategy) -> Arc<Target> {
        let slot = match strategy {
            Strategy::Random => rand::thread_rng().gen_range(0..self.wheel.len()),
            Strategy::RoundRobin => self.rr.fetch_add(1, Ordering::Relaxed) % self.wheel.len(),
        };
        Arc::clone(&self.targets[self.wheel[slot] as usize])
    }

    fn pick_filtered(
        eligible: &[&Arc<Target>],
        rr: &AtomicUsize,
        strategy: Strategy,
    ) -> Arc<Target> {
        match strategy {
            Strategy::RoundRobin => {
                let idx = rr.fetch_add(1, Ordering::Relaxed) % eligible.len();
                Arc::clone(eligible[idx])
            }
            Strategy::Random => {
                let sum: f64 = eligible.iter().map(|t| t.weight).sum();
                if sum <= 0.0 {
                    let idx = rand::thread_rng().gen_range(0..eligible.len());
                    return Arc::clone(eligible[idx]);
                }
                let mut draw = rand::thread_rng().gen_range(0.0..sum);
                for t in eligible {
                    if draw < t.weight {
                        return Arc::clone(t);
                    }
                    draw -= t.weight;
                }
                Arc::clone(eligible[eligible.len() - 1])
            }
        }
    }

    /// Sort key: regex routes after literals, longer literal paths first.
    fn specificity(&self) -> (bool, std::cmp::Reverse<usize>) {
        (
            self.path_regex.is_some(),
            std::cmp::Reverse(if self.path_regex.is_some() {
                0
            } else {
                self.path.len()
            }),
        )
    }
}

/// Immutable compiled set of routes, aliases, and host indices.
#[derive(Debug, Default)]
pub struct Table {
    hosts: HashMap<String, Vec<Arc<Route>>>,
    aliases: HashMap<String, String>,
    /// Wildcard host suffixes (`.example.com` for `*.example.com`),
    /// longest first, declaration order on ties.
    wildcards: Vec<(String, String)>,
    port_rr: AtomicUsize,
}

/// Strips default ports and case-folds a request host for lookup.
pub fn normalize_host(host: &str, tls: bool) -> String {
    let mut h = host.to_ascii_lowercase();
    if !tls {
        if let Some(stripped) = h.strip_suffix(":80") {
            h = stripped.to_string();
        }
    } else if let Some(stripped) = h.strip_suffix(":443") {
        h = stripped.to_string();
    }
    h.trim_end_matches('.').to_string()
}

impl Table {
    /// Builds a table by applying route commands in order. Later commands
    /// see the effect of earlier ones. Any invalid command fails the
    /// whole build.
    pub fn from_commands(cmds: &[RouteCmd]) -> Result<Self> {
        let mut builder = Builder::default();
        for cmd in cmds {
            builder.apply(cmd)?;
        }
        builder.freeze()
    }

    /// Parses route command text and builds a table from it.
    pub fn parse(text: &str) -> Result<Self> {
        let cmds = crate::parser::parse(text)?;
        Self::from_commands(&cmds)
    }

    /// Full lookup: host precedence, path specificity, tag filter, and
    /// strategy selection. Pure and non-suspending.
    #[allow(clippy::too_many_arguments)]
    pub fn lookup(
        &self,
        host: &str,
        path: &str,
        req_tags: Option<&HashSet<&str>>,
        trace: Option<&str>,
        strategy: Strategy,
        matcher: Matcher,
        glob: &GlobCache,
        glob_disabled: bool,
    ) -> Option<Arc<Target>> {
        for key in self.host_candidates(host) {
            let routes = match self.hosts.get(key) {
                Some(r) => r,
                None => continue,
            };
            for route in routes {
                if !route.matches_path(path, matcher, glob, glob_disabled) {
                    continue;
                }
                if let Some(target) = route.pick(req_tags, strategy) {
                    debug!(
                        host = %host,
                        path = %path,
                        route_host = %route.host,
                        route_path = %route.path,
                        upstream = %target.url,
                        trace = trace.unwrap_or(""),
                        "matched route"
                    );
                    return Some(target);
                }
            }
        }
        None
    }

    /// Host-only fast path used by the L4 forwarders.
    pub fn lookup_host(&self, host: &str, strategy: Strategy) -> Option<Arc<Target>> {
        for key in self.host_candidates(host) {
            if let Some(routes) = self.hosts.get(key) {
                for route in routes {
                    if let Some(target) = route.pick(None, strategy) {
                        return Some(target);
                    }
                }
            }
        }
        None
    }

    /// Selects among `tcp`-proto targets whose backend URL carries `port`.
    /// Used by dynamic TCP listeners.
    pub fn lookup_port(&self, port: u16, strategy: Strategy) -> Option<Arc<Target>> {
        let eligible: Vec<&Arc<Target>> = self
            .iter_routes()
            .flat_map(|r| r.targets.iter())
            .filter(|t| t.proto() == "tcp" && t.url.port_u16() == Some(port))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        Some(Route::pick_filtered(&eligible, &self.port_rr, strategy))
    }

    /// Distinct backend ports referenced exclusively via `tcp`-proto
    /// targets. Ports also referenced by non-tcp targets are excluded.
    pub fn tcp_backend_ports(&self) -> BTreeSet<u16> {
        let mut tcp_ports = BTreeSet::new();
        let mut other_ports = BTreeSet::new();
        for t in self.iter_routes().flat_map(|r| r.targets.iter()) {
            if let Some(port) = t.url.port_u16() {
                if t.proto() == "tcp" {
                    tcp_ports.insert(port);
                } else {
                    other_ports.insert(port);
                }
            }
        }
        tcp_ports.difference(&other_ports).copied().collect()
    }

    fn host_candidates<'a>(&'a self, host: &'a str) -> Vec<&'a str> {
        let mut out: Vec<&str> = Vec::with_capacity(4);
        if self.hosts.contains_key(host) {
            out.push(
                self.hosts
                    .get_key_value(host)
                    .map(|(k, _)| k.as_str())
                    .unwrap_or(host),
            );
        }
        if let Some(canon) = self.aliases.get(host) {
            if self.hosts.contains_key(canon) && !out.contains(&canon.as_str()) {
                out.push(canon);
            }
        }
        for (suffix, key) in &self.wildcards {
            if host.len() > suffix.len()
                && host.ends_with(suffix.as_str())
                && !out.contains(&key.as_str())
            {
                out.push(key);
            }
        }
        if self.hosts.contains_key("") && !out.contains(&"") {
            out.push("");
        }
        out
    }

    fn iter_routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.hosts.values().flatten()
    }

    pub fn route_count(&self) -> usize {
        self.hosts.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Renders the table back to route command text. The output re-parses
    /// to an equivalent table.
    pub fn dump(&self) -> String {
        let mut hosts: Vec<&String> = self.hosts.keys().collect();
        hosts.sort();

        let mut out = String::new();
        for host in hosts {
            for route in &self.hosts[host] {
                for target in &route.targets {
                    let _ = write!(
                        out,
                        "route add {} {}{} {}",
                        target.service, route.host, route.path, target.url
                    );
                    if let Some(w) = target.fixed_weight {
                        let _ = write!(out, " weight {:.4}", w);
                    }
                    if !target.tags.is_empty() {
                        let _ = write!(out, " tags \"{}\"", target.tags.join(","));
                    }
                    if !target.opts.is_empty() {
                        let mut keys: Vec<&String> = target.opts.keys().collect();
                        keys.sort();
                        let opts = keys
                            .iter()
                            .map(|k| format!("{}={}", k, target.opts[*k]))
                            .collect::<Vec<_>>()
                            .join(" ");
                        let _ = write!(out, " opts \"{}\"", opts);
                    }
                    out.push('\n');
                }
            }
        }

        let mut aliases: Vec<(&String, &String)> = self.aliases.iter().collect();
        aliases.sort();
        for (alias, host) in aliases {
            let _ = writeln!(out, "route alias {} {}", alias, host);
        }
        out
    }
}

/// Mutable accumulation state while applying commands.
#[derive(Default)]
struct Builder {
    // Declaration order of (host, path) rules.
    routes: Vec<RouteAccum>,
    aliases: HashMap<String, String>,
}

struct RouteAccum {
    host: String,
    path: String,
    targets: Vec<TargetAccum>,
}

struct TargetAccum {
    service: String,
    url: Uri,
    tags: Vec<String>,
    opts: HashMap<String, String>,
    fixed_weight: Option<f64>,
}

impl Builder {
    fn apply(&mut self, cmd: &RouteCmd) -> Result<()> {
        match cmd {
            RouteCmd::Add {
                service,
                host,
                path,
                url,
                weight,
                tags,
                opts,
            } => {
                // `file:///path` has an empty authority, which Uri
                // rejects; pin it to localhost.
                let url = match url.strip_prefix("file:///") {
                    Some(rest) => format!("file://localhost/{}", rest),
                    None => url.clone(),
                };
                let uri: Uri = url
                    .parse()
                    .map_err(|e| ProxyError::Config(format!("invalid target URL {:?}: {}", url, e)))?;
                let scheme = uri.scheme_str().unwrap_or("");
                if !VALID_SCHEMES.contains(&scheme) {
                    return Err(ProxyError::Config(format!(
                        "invalid scheme {:?} in target URL {:?}",
                        scheme, url
                    )));
                }
                if let Some(w) = weight {
                    if !(0.0..=1.0).contains(w) {
                        return Err(ProxyError::Config(format!(
                            "weight {} outside [0,1] for {:?}",
                            w, url
                        )));
                    }
                }
                let route = self.route_mut(host, path);
                // A re-add of the same service+URL replaces the old entry.
                route
                    .targets
                    .retain(|t| !(t.service == *service && t.url == uri));
                route.targets.push(TargetAccum {
                    service: service.clone(),
                    url: uri,
                    tags: tags.clone(),
                    opts: opts.clone(),
                    fixed_weight: *weight,
                });
            }

            RouteCmd::Del { service, host, path, url } => {
                let uri = match url {
                    Some(u) => Some(u.parse::<Uri>().map_err(|e| {
                        ProxyError::Config(format!("invalid target URL {:?}: {}", u, e))
                    })?),
                    None => None,
                };
                for route in &mut self.routes {
                    let in_scope = match (host, path) {
                        (Some(h), Some(p)) => route.host == *h && route.path == *p,
                        _ => true,
                    };
                    if !in_scope {
                        continue;
                    }
                    route.targets.retain(|t| {
                        t.service != *service
                            || uri.as_ref().is_some_and(|u| t.url != *u)
                    });
                }
                self.routes.retain(|r| !r.targets.is_empty());
            }

            RouteCmd::Weight {
                service,
                host,
                path,
                weight,
                tags,
            } => {
                if !(0.0..=1.0).contains(weight) {
                    return Err(ProxyError::Config(format!(
                        "weight {} outside [0,1]",
                        weight
                    )));
                }
                for route in &mut self.routes {
                    if route.host != *host || route.path != *path {
                        continue;
                    }
                    for t in &mut route.targets {
                        let svc_ok = service.is_empty() || t.service == *service;
                        let tags_ok = tags.iter().all(|tag| t.tags.contains(tag));
                        if svc_ok && tags_ok {
                            t.fixed_weight = Some(*weight);
                        }
                    }
                }
            }

            RouteCmd::Alias { alias, host } => {
                self.aliases
                    .insert(alias.to_ascii_lowercase(), host.to_ascii_lowercase());
            }
        }
        Ok(())
    }

    fn route_mut(&mut self, host: &str, path: &str) -> &mut RouteAccum {
        let host = host.to_ascii_lowercase();
        if let Some(idx) = self
            .routes
            .iter()
            .position(|r| r.host == host && r.path == path)
        {
            &mut self.routes[idx]
        } else {
            self.routes.push(RouteAccum {
                host,
                path: path.to_string(),
                targets: Vec::new(),
            });
            self.routes.last_mut().expect("just pushed")
        }
    }

    fn freeze(self) -> Result<Table> {
        let mut hosts: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        let mut wildcards: Vec<(String, String)> = Vec::new();

        for accum in self.routes {
            let weights = distribute_weights(&accum.targets);
            let wheel = build_wheel(&weights);

            let path_regex = match accum.path.strip_prefix('~') {
                Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                    ProxyError::Config(format!("invalid path regex {:?}: {}", pattern, e))
                })?),
                None => None,
            };

            let targets: Vec<Arc<Target>> = accum
                .targets
                .into_iter()
                .zip(weights)
                .map(|(t, weight)| {
                    Arc::new(Target {
                        timer_name: format!("{}.{}{}", t.service, accum.host, accum.path),
                        service: t.service,
                        url: t.url,
                        tags: t.tags,
                        opts: t.opts,
                        fixed_weight: t.fixed_weight,
                        weight,
                    })
                })
                .collect();

            let route = Arc::new(Route {
                path_lower: accum.path.to_ascii_lowercase(),
                host: accum.host.clone(),
                path: accum.path,
                targets,
                wheel,
                path_regex,
                rr: AtomicUsize::new(0),
            });

            if let Some(rest) = accum.host.strip_prefix('*') {
                if !wildcards.iter().any(|(_, k)| *k == accum.host) {
                    wildcards.push((rest.to_string(), accum.host.clone()));
                }
            }
            hosts.entry(accum.host).or_default().push(route);
        }

        for routes in hosts.values_mut() {
            routes.sort_by_key(|r| r.specificity());
        }
        // Longest suffix wins; declaration order breaks ties (stable sort).
        wildcards.sort_by_key(|(suffix, _)| std::cmp::Reverse(suffix.len()));

        Ok(Table {
            hosts,
            aliases: self.aliases,
            wildcards,
            port_rr: AtomicUsize::new(0),
        })
    }
}

/// Distributes unassigned weight evenly across targets without a fixed
/// weight. A fixed-weight total above 1.0 is scaled back down to 1.0.
fn distribute_weights(targets: &[TargetAccum]) -> Vec<f64> {
    let fixed_sum: f64 = targets.iter().filter_map(|t| t.fixed_weight).sum();
    let unfixed = targets.iter().filter(|t| t.fixed_weight.is_none()).count();

    let scale = if fixed_sum > 1.0 { 1.0 / fixed_sum } else { 1.0 };
    let remainder = (1.0 - fixed_sum * scale).max(0.0);
    let share = if unfixed > 0 {
        remainder / unfixed as f64
    } else {
        0.0
    };

    targets
        .iter()
        .map(|t| match t.fixed_weight {
            Some(w) => w * scale,
            None => share,
        })
        .collect()
}

/// Builds the slot wheel by largest-remainder apportionment, interleaving
/// slots so round-robin traversal alternates between targets instead of
/// bursting.
fn build_wheel(weights: &[f64]) -> Vec<u16> {
    let total: f64 = weights.iter().sum();
    if weights.is_empty() || total <= 0.0 {
        return Vec::new();
    }

    let mut slots: Vec<usize> = weights
        .iter()
        .map(|w| (w / total * WHEEL_SIZE as f64).floor() as usize)
        .collect();
    let assigned: usize = slots.iter().sum();

    // Hand leftover slots to the largest remainders.
    let mut remainders: Vec<(usize, f64)> = weights
        .iter()
        .enumerate()
        .map(|(i, w)| (i, w / total * WHEEL_SIZE as f64 - slots[i] as f64))
        .collect();
    remainders.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    for (i, _) in remainders.iter().take(WHEEL_SIZE - assigned) {
        slots[*i] += 1;
    }

    // Deficit-based interleave.
    let mut wheel = Vec::with_capacity(WHEEL_SIZE);
    let mut given = vec![0usize; slots.len()];
    for step in 0..WHEEL_SIZE {
        let mut best: Option<usize> = None;
        let mut best_deficit = f64::MIN;
        for (i, &quota) in slots.iter().enumerate() {
            if given[i] >= quota {
                continue;
            }
            let deficit = quota as f64 * (step + 1) as f64 / WHEEL_SIZE as f64 - given[i] as f64;
            if deficit > best_deficit {
                best_deficit = deficit;
                best = Some(i);
            }
        }
        match best {
            Some(i) => {
                given[i] += 1;
                wheel.push(i as u16);
            }
            None => break,
        }
    }
    wheel
}

/// Process-wide register of the current table snapshot.
///
/// Publication is an atomic pointer swap; old snapshots are dropped when
/// their last in-flight reader releases them.
#[derive(Debug)]
pub struct TableHandle {
    current: ArcSwap<Table>,
}

impl TableHandle {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Table::default()),
        }
    }

    /// Loads the current snapshot. Callers hold the `Arc` for the
    /// duration of the request.
    pub fn load(&self) -> Arc<Table> {
        self.current.load_full()
    }

    /// Atomically publishes a new snapshot.
    pub fn store(&self, table: Table) {
        self.current.store(Arc::new(table));
    }
}

impl Default for TableHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob_cache() -> GlobCache {
        GlobCache::new(100)
    }

    fn lookup(table: &Table, host: &str, path: &str) -> Option<Arc<Target>> {
        table.lookup(
            host,
            path,
            None,
            None,
            Strategy::RoundRobin,
            Matcher::Prefix,
            &glob_cache(),
            false,
        )
    }

    #[test]
    fn test_exact_host_lookup() {
        let t = Table::parse("route add svc example.com/ http://10.0.0.1:80/").unwrap();
        let target = lookup(&t, "example.com", "/").unwrap();
        assert_eq!(target.url.to_string(), "http://10.0.0.1:80/");
        assert!(lookup(&t, "other.com", "/").is_none());
    }

    #[test]
    fn test_path_specificity() {
        let t = Table::parse(
            "route add api example.com/v1/ http://10.0.0.3:80/\n\
             route add api2 example.com/v1/users http://10.0.0.4:80/",
        )
        .unwrap();
        assert_eq!(
            lookup(&t, "example.com", "/v1/users/42").unwrap().service,
            "api2"
        );
        assert_eq!(lookup(&t, "example.com", "/v1/orders").unwrap().service, "api");
    }

    #[test]
    fn test_regex_path_after_literals() {
        let t = Table::parse(
            "route add re example.com~^/v1/[0-9]+$ http://10.0.0.9:80/\n\
             route add lit example.com/v1/9 http://10.0.0.8:80/",
        )
        .unwrap();
        // Literal matches first even though the regex was declared first.
        assert_eq!(lookup(&t, "example.com", "/v1/9").unwrap().service, "lit");
        assert_eq!(lookup(&t, "example.com", "/v1/42").unwrap().service, "re");
    }

    #[test]
    fn test_wildcard_host() {
        let t = Table::parse("route add s *.api.example.com/ http://10.0.0.5:80/").unwrap();
        assert!(lookup(&t, "foo.api.example.com", "/").is_some());
        assert!(lookup(&t, "api.example.com", "/").is_none());
        assert!(lookup(&t, "bar.example.com", "/").is_none());
    }

    #[test]
    fn test_wildcard_longest_suffix_wins() {
        let t = Table::parse(
            "route add broad *.example.com/ http://10.0.0.1:80/\n\
             route add narrow *.api.example.com/ http://10.0.0.2:80/",
        )
        .unwrap();
        assert_eq!(
            lookup(&t, "x.api.example.com", "/").unwrap().service,
            "narrow"
        );
        assert_eq!(lookup(&t, "x.example.com", "/").unwrap().service, "broad");
    }

    #[test]
    fn test_alias_and_catch_all() {
        let t = Table::parse(
            "route add svc example.com/ http://10.0.0.1:80/\n\
             route alias www.example.net example.com\n\
             route add any / http://10.0.0.9:80/",
        )
        .unwrap();
        assert_eq!(lookup(&t, "www.example.net", "/").unwrap().service, "svc");
        // Unknown host falls through to the empty-host catch-all.
        assert_eq!(lookup(&t, "unknown.host", "/x").unwrap().service, "any");
    }

    #[test]
    fn test_del_commands() {
        let t = Table::parse(
            "route add a example.com/ http://10.0.0.1:80/\n\
             route add b example.com/ http://10.0.0.2:80/\n\
             route del a",
        )
        .unwrap();
        for _ in 0..10 {
            assert_eq!(lookup(&t, "example.com", "/").unwrap().service, "b");
        }

        let t = Table::parse(
            "route add a example.com/ http://10.0.0.1:80/\n\
             route del a example.com/",
        )
        .unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn test_weight_command_applies_by_tag() {
        let t = Table::parse(
            "route add a example.com/ http://10.0.0.1:80/ tags \"blue\"\n\
             route add a example.com/ http://10.0.0.2:80/ tags \"green\"\n\
             route weight a example.com/ weight 0.9 tags \"blue\"",
        )
        .unwrap();
        let routes = &t.hosts["example.com"];
        let blue = routes[0]
            .targets
            .iter()
            .find(|t| t.tags.contains(&"blue".to_string()))
            .unwrap();
        assert_eq!(blue.fixed_weight, Some(0.9));
        assert!((blue.weight - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_weight_distribution_rnd() {
        let t = Table::parse(
            "route add a example.com/ http://10.0.0.1:80/ weight 0.75\n\
             route add b example.com/ http://10.0.0.2:80/ weight 0.25",
        )
        .unwrap();
        let cache = glob_cache();
        let mut hits = HashMap::new();
        for _ in 0..10_000 {
            let target = t
                .lookup(
                    "example.com",
                    "/",
                    None,
                    None,
                    Strategy::Random,
                    Matcher::Prefix,
                    &cache,
                    false,
                )
                .unwrap();
            *hits.entry(target.service.clone()).or_insert(0u32) += 1;
        }
        let a = f64::from(hits["a"]);
        let b = f64::from(hits["b"]);
        let ratio = a / (a + b);
        assert!((ratio - 0.75).abs() < 0.05, "ratio was {}", ratio);
    }

    #[test]
    fn test_wheel_quantization() {
        let weights = [0.75, 0.25];
        let wheel = build_wheel(&weights);
        assert_eq!(wheel.len(), WHEEL_SIZE);
        for (i, w) in weights.iter().enumerate() {
            let slots = wheel.iter().filter(|&&s| s as usize == i).count();
            let share = slots as f64 / wheel.len() as f64;
            assert!(
                (share - w).abs() <= 1.0 / WHEEL_SIZE as f64,
                "target {} share {} weight {}",
                i,
                share,
                w
            );
        }
    }

    #[test]
    fn test_wheel_interleaves() {
        let wheel = build_wheel(&[0.5, 0.5]);
        // Equal weights must alternate rather than burst.
        assert_ne!(wheel[0], wheel[1]);
    }

    #[test]
    fn test_unassigned_weight_distributed() {
        let t = Table::parse(
            "route add a example.com/ http://10.0.0.1:80/ weight 0.5\n\
             route add b example.com/ http://10.0.0.2:80/\n\
             route add c example.com/ http://10.0.0.3:80/",
        )
        .unwrap();
        let route = &t.hosts["example.com"][0];
        let by_service: HashMap<&str, f64> = route
            .targets
            .iter()
            .map(|t| (t.service.as_str(), t.weight))
            .collect();
        assert!((by_service["a"] - 0.5).abs() < 1e-9);
        assert!((by_service["b"] - 0.25).abs() < 1e-9);
        assert!((by_service["c"] - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_tag_filter() {
        let t = Table::parse(
            "route add a example.com/ http://10.0.0.1:80/ tags \"prod,eu\"\n\
             route add b example.com/ http://10.0.0.2:80/ tags \"staging\"\n\
             route add c example.com/ http://10.0.0.3:80/",
        )
        .unwrap();
        let cache = glob_cache();
        let tags: HashSet<&str> = ["prod", "eu"].into_iter().collect();
        for _ in 0..20 {
            let target = t
                .lookup(
                    "example.com",
                    "/",
                    Some(&tags),
                    None,
                    Strategy::RoundRobin,
                    Matcher::Prefix,
                    &cache,
                    false,
                )
                .unwrap();
            // "b" requires the staging tag; "c" is tag-less and a wildcard.
            assert_ne!(target.service, "b");
        }
    }

    #[test]
    fn test_tag_filter_skips_to_less_specific_route() {
        let t = Table::parse(
            "route add v1 example.com/v1/ http://10.0.0.1:80/ tags \"canary\"\n\
             route add all example.com/ http://10.0.0.2:80/",
        )
        .unwrap();
        let cache = glob_cache();
        let tags: HashSet<&str> = HashSet::new();
        let target = t
            .lookup(
                "example.com",
                "/v1/users",
                Some(&tags),
                None,
                Strategy::RoundRobin,
                Matcher::Prefix,
                &cache,
                false,
            )
            .unwrap();
        // The canary-only route is skipped, not turned into a 404.
        assert_eq!(target.service, "all");
    }

    #[test]
    fn test_lookup_host() {
        let t = Table::parse("route add db db.example.com/ tcp://10.0.0.6:5432").unwrap();
        let target = t.lookup_host("db.example.com", Strategy::RoundRobin).unwrap();
        assert_eq!(target.proto(), "tcp");
        assert!(t.lookup_host("other.com", Strategy::RoundRobin).is_none());
    }

    #[test]
    fn test_tcp_backend_ports() {
        let t = Table::parse(
            "route add db db.example.com/ tcp://10.0.0.7:9000\n\
             route add web example.com/ http://10.0.0.1:8080/",
        )
        .unwrap();
        let ports = t.tcp_backend_ports();
        assert!(ports.contains(&9000));
        assert!(!ports.contains(&8080));

        let target = t.lookup_port(9000, Strategy::RoundRobin).unwrap();
        assert_eq!(target.service, "db");
        assert!(t.lookup_port(9001, Strategy::RoundRobin).is_none());
    }

    #[test]
    fn test_invalid_scheme_rejected() {
        assert!(Table::parse("route add s example.com/ ftp://10.0.0.1:21/").is_err());
    }

    #[test]
    fn test_invalid_weight_rejected() {
        assert!(Table::parse("route add s example.com/ http://10.0.0.1/ weight 1.5").is_err());
    }

    #[test]
    fn test_dump_round_trip() {
        let text = "route add a example.com/v1/ http://10.0.0.1:80/ weight 0.2500 tags \"eu\"\n\
                    route add b example.com/ https://10.0.0.2:443/ opts \"tlsskipverify=true\"\n\
                    route alias www.example.org example.com\n";
        let t = Table::parse(text).unwrap();
        let dumped = t.dump();
        let t2 = Table::parse(&dumped).unwrap();
        assert_eq!(t2.dump(), dumped);
        assert_eq!(t2.route_count(), t.route_count());
    }

    #[test]
    fn test_lookup_unaffected_by_unrelated_route() {
        let base = "route add a example.com/ http://10.0.0.1:80/";
        let t1 = Table::parse(base).unwrap();
        let t2 = Table::parse(&format!("{}\nroute add z other.com/ http://10.0.0.9:80/", base))
            .unwrap();
        let r1 = lookup(&t1, "example.com", "/").unwrap();
        let r2 = lookup(&t2, "example.com", "/").unwrap();
        assert_eq!(r1.url, r2.url);
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM:80", false), "example.com");
        assert_eq!(normalize_host("example.com:443", true), "example.com");
        assert_eq!(normalize_host("example.com:8080", false), "example.com:8080");
        assert_eq!(normalize_host("example.com.", false), "example.com");
    }

    #[test]
    fn test_empty_table_replaces() {
        let handle = TableHandle::new();
        handle.store(Table::parse("route add a example.com/ http://10.0.0.1:80/").unwrap());
        assert_eq!(handle.load().route_count(), 1);
        handle.store(Table::parse("").unwrap());
        assert!(handle.load().is_empty());
    }

    #[test]
    fn test_rr_deterministic() {
        let t = Table::parse(
            "route add a example.com/ http://10.0.0.1:80/\n\
             route add b example.com/ http://10.0.0.2:80/",
        )
        .unwrap();
        let first = lookup(&t, "example.com", "/").unwrap();
        let second = lookup(&t, "example.com", "/").unwrap();
        assert_ne!(first.service, second.service);
        let third = lookup(&t, "example.com", "/").unwrap();
        assert_eq!(first.service, third.service);
    }
}
