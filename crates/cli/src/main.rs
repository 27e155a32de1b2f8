use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kube::Client;
use refuge_controller::{Controller, ControllerConfig};
use refuge_core::{Action, Event};
use refuge_kubehub::{discover_watchable, kind_label, parse_gvk_key, run_discovery, KubeInformer};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "refuge", version, about = "Watch Kubernetes kinds and emit normalized change events")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict watches to one namespace (default: all namespaces)
    #[arg(long = "ns", env = "REFUGE_NAMESPACE", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List served kinds that support list and watch
    Discover,
    /// Watch kinds and print one event per created, updated or deleted object
    Watch {
        /// GVK key, e.g. "v1/Namespace" or "apps/v1/Deployment"; repeatable
        #[arg(long = "kind", env = "REFUGE_KINDS", value_delimiter = ',')]
        kinds: Vec<String>,
        /// Watch every discovered kind
        #[arg(long = "all", action = ArgAction::SetTrue)]
        all: bool,
        /// Kind name or GVK key to leave out; repeatable
        #[arg(long = "exclude", value_delimiter = ',')]
        exclude: Vec<String>,
        /// Full resync period in seconds (0 disables)
        #[arg(long = "resync-secs", env = "REFUGE_RESYNC_SECS", default_value_t = 900)]
        resync_secs: u64,
        /// Processing attempts per key before it is dropped
        #[arg(long = "max-attempts", default_value_t = 6)]
        max_attempts: u32,
        /// Capacity of the shared event channel
        #[arg(long = "event-cap", env = "REFUGE_EVENT_CAP", default_value_t = 1024)]
        event_cap: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("REFUGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REFUGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REFUGE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Merge explicit and discovered GVK keys, drop exclusions and duplicates, keep first-seen order.
fn select_kinds(explicit: Vec<String>, discovered: Vec<String>, exclude: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for key in explicit.into_iter().chain(discovered) {
        let key = key.trim().to_string();
        if key.is_empty() || out.contains(&key) || is_excluded(&key, exclude) {
            continue;
        }
        out.push(key);
    }
    out
}

/// An exclusion matches either the full GVK key or, case-insensitively, the bare kind.
fn is_excluded(key: &str, exclude: &[String]) -> bool {
    let kind = key.rsplit('/').next().unwrap_or(key);
    exclude.iter().any(|x| x == key || x.eq_ignore_ascii_case(kind))
}

/// Pair each GVK key with the kind label its controller and events carry. Labels are unique:
/// a second version of an already planned group/kind would mirror the same objects and is skipped.
fn plan_controllers(keys: &[String]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::with_capacity(keys.len());
    for key in keys {
        let label = match parse_gvk_key(key) {
            Ok(gvk) => kind_label(&gvk),
            Err(e) => {
                warn!(gvk = %key, error = %e, "skipping kind");
                continue;
            }
        };
        if let Some((first, _)) = out.iter().find(|(_, l)| *l == label) {
            warn!(gvk = %key, watched_as = %first, kind = %label, "kind already watched; skipping");
            continue;
        }
        out.push((key.clone(), label));
    }
    out
}

fn render(ev: &Event, output: Output) -> Result<String> {
    Ok(match output {
        Output::Human => {
            let sign = match ev.action { Action::Upsert => '+', Action::Delete => '-' };
            format!("{} {} {}", sign, ev.kind, ev.key)
        }
        Output::Json => serde_json::to_string(ev)?,
        Output::Yaml => format!("---\n# {} {} {}\n{}", ev.action, ev.kind, ev.key, ev.obj.trim_end()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover => {
            let client = Client::try_default().await.context("building kube client")?;
            let resources = discover_watchable(&run_discovery(client).await?);
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {}", r.gvk_key(), scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
                Output::Yaml => {
                    for r in resources {
                        println!("- {}", r.gvk_key());
                    }
                }
            }
        }
        Commands::Watch { kinds, all, exclude, resync_secs, max_attempts, event_cap } => {
            let client = Client::try_default().await.context("building kube client")?;
            let discovery = run_discovery(client.clone()).await?;
            let discovered = if all {
                discover_watchable(&discovery).into_iter().map(|r| r.gvk_key()).collect()
            } else {
                Vec::new()
            };
            let keys = select_kinds(kinds, discovered, &exclude);
            if keys.is_empty() {
                bail!("nothing to watch; pass --kind or --all");
            }

            let config = ControllerConfig {
                resync: (resync_secs > 0).then(|| Duration::from_secs(resync_secs)),
                max_attempts: max_attempts.max(1),
                ..ControllerConfig::default()
            };
            let (tx, mut rx) = mpsc::channel::<Event>(event_cap.max(1));
            let output = cli.output;
            let sink = tokio::spawn(async move {
                let mut seen = 0u64;
                while let Some(ev) = rx.recv().await {
                    seen += 1;
                    match render(&ev, output) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!(key = %ev.key, error = %e, "failed to render event"),
                    }
                }
                seen
            });

            let mut controllers = Vec::with_capacity(keys.len());
            for (key, label) in plan_controllers(&keys) {
                match KubeInformer::new(client.clone(), &discovery, &key, cli.namespace.as_deref()) {
                    Ok(informer) => {
                        let c = Controller::new(Arc::new(informer), tx.clone(), label, config.clone());
                        c.start();
                        controllers.push(c);
                    }
                    Err(e) => warn!(gvk = %key, error = %e, "skipping kind"),
                }
            }
            drop(tx);
            if controllers.is_empty() {
                bail!("none of the requested kinds could be resolved");
            }
            info!(kinds = controllers.len(), ns = ?cli.namespace, "watching; press Ctrl-C to stop");

            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; stopping controllers");
            futures::future::join_all(controllers.iter().map(|c| c.stop())).await;
            drop(controllers);
            let seen = sink.await.context("event sink task")?;
            info!(events = seen, "stopped");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> { v.iter().map(|x| x.to_string()).collect() }

    #[test]
    fn select_kinds_dedups_and_keeps_order() {
        let got = select_kinds(s(&["v1/Namespace", "apps/v1/Deployment"]), s(&["v1/ConfigMap", "v1/Namespace"]), &[]);
        assert_eq!(got, s(&["v1/Namespace", "apps/v1/Deployment", "v1/ConfigMap"]));
    }

    #[test]
    fn exclusions_match_key_or_kind() {
        let got = select_kinds(
            Vec::new(),
            s(&["v1/Event", "events.k8s.io/v1/Event", "v1/Secret", "v1/ConfigMap"]),
            &s(&["event", "v1/Secret"]),
        );
        assert_eq!(got, s(&["v1/ConfigMap"]));
    }

    #[test]
    fn same_kind_in_two_groups_gets_distinct_labels() {
        let keys = select_kinds(Vec::new(), s(&["v1/Event", "events.k8s.io/v1/Event"]), &[]);
        let plan = plan_controllers(&keys);
        assert_eq!(
            plan,
            vec![
                ("v1/Event".to_string(), "Event".to_string()),
                ("events.k8s.io/v1/Event".to_string(), "Event.events.k8s.io".to_string()),
            ]
        );
    }

    #[test]
    fn second_version_of_a_kind_is_not_watched_twice() {
        let plan = plan_controllers(&s(&["apps/v1/Deployment", "apps/v1beta2/Deployment", "bogus"]));
        assert_eq!(plan, vec![("apps/v1/Deployment".to_string(), "Deployment.apps".to_string())]);
    }

    #[test]
    fn blank_entries_are_ignored() {
        assert!(select_kinds(s(&["", "  "]), Vec::new(), &[]).is_empty());
    }

    #[test]
    fn renders_human_and_json() {
        let ev = Event::delete("prod/web", "Deployment");
        assert_eq!(render(&ev, Output::Human).unwrap(), "- Deployment prod/web");
        let v: serde_json::Value = serde_json::from_str(&render(&ev, Output::Json).unwrap()).unwrap();
        assert_eq!(v["action"], "delete");
        assert_eq!(v["key"], "prod/web");

        let ev = Event::upsert("default", "Namespace", "metadata:\n  name: default\n".to_string());
        assert_eq!(render(&ev, Output::Human).unwrap(), "+ Namespace default");
        assert_eq!(
            render(&ev, Output::Yaml).unwrap(),
            "---\n# upsert Namespace default\nmetadata:\n  name: default"
        );
    }
}
