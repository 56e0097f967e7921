//! Runs one reconciliation between two in-process peers.
//!
//! The left peer initiates, the right peer listens and accepts. Both run
//! either on the deterministic [`MemoryNetwork`] or as async nodes on a
//! [`MemoryHub`].

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use setrecon_service::{
    spawn, ClientEvent, MemoryHub, MemoryNetwork, OperationId, OperationOptions, ResultMode,
    ResultStatus, ServiceConfig, SetService,
};
use setrecon_types::{AppId, Element, OperationType, PeerId};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

/// Application id both peers agree on.
const APP_NAME: &str = "setrecon-cli";

/// One reconciliation to run.
#[derive(Debug, Clone)]
pub struct Job {
    pub op_type: OperationType,
    pub mode: ResultMode,
    pub options: OperationOptions,
    pub config: ServiceConfig,
    pub left: Vec<Element>,
    pub right: Vec<Element>,
    /// How long the async run may take.
    pub timeout: Duration,
}

/// A result element, payload rendered as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultLine {
    pub status: ResultStatus,
    pub element: String,
}

/// What one peer reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerReport {
    pub status: ResultStatus,
    pub results: Vec<ResultLine>,
}

impl PeerReport {
    /// Elements reported with `status`, sorted.
    pub fn elements(&self, status: ResultStatus) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .results
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.element.as_str())
            .collect();
        out.sort_unstable();
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub left: PeerReport,
    pub right: PeerReport,
    /// Frames and bytes moved; only known for the in-memory network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

/// Reads one element per non-empty line.
pub fn read_elements(path: &Path) -> Result<Vec<Element>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut elements = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let element = Element::from_bytes(line.as_bytes().to_vec());
        element
            .validate()
            .with_context(|| format!("{}:{}", path.display(), n + 1))?;
        elements.push(element);
    }
    Ok(elements)
}

/// Loads a JSON service config; missing fields keep their defaults.
pub fn load_config(path: &Path) -> Result<ServiceConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: ServiceConfig = serde_json::from_str(&text)
        .with_context(|| format!("invalid config {}", path.display()))?;
    config.validate().context("config rejected")?;
    Ok(config)
}

fn report_from(events: &[ClientEvent], op: OperationId) -> Result<PeerReport> {
    let mut results = Vec::new();
    let mut terminal = None;
    for event in events {
        let ClientEvent::Result {
            operation,
            element,
            status,
        } = event
        else {
            continue;
        };
        if *operation != op {
            continue;
        }
        match element {
            Some(e) => results.push(ResultLine {
                status: *status,
                element: String::from_utf8_lossy(&e.data).into_owned(),
            }),
            None => terminal = Some(*status),
        }
    }
    let status = terminal.ok_or_else(|| anyhow!("{op} never finished"))?;
    Ok(PeerReport { status, results })
}

fn populate(svc: &mut SetService, job: &Job, items: &[Element]) -> Result<setrecon_service::SetId> {
    let set = svc.create_set(job.op_type);
    for e in items {
        svc.add_element(set, e.clone())?;
    }
    Ok(set)
}

/// Runs the job on the deterministic in-memory network.
pub fn run_sync(job: &Job) -> Result<Report> {
    let app = AppId::from_name(APP_NAME);
    let mut net = MemoryNetwork::new();
    let left = net.add_peer(SetService::new(PeerId::new(), job.config.clone())?);
    let right = net.add_peer(SetService::new(PeerId::new(), job.config.clone())?);

    let svc = net.service_mut(right).context("right peer missing")?;
    let set_right = populate(svc, job, &job.right)?;
    svc.listen(job.op_type, app)?;

    let svc = net.service_mut(left).context("left peer missing")?;
    let set_left = populate(svc, job, &job.left)?;
    let op_left = svc.evaluate(set_left, right, app, None, job.mode, job.options)?;
    net.run()?;

    let svc = net.service_mut(right).context("right peer missing")?;
    let request = svc
        .take_events()
        .into_iter()
        .find_map(|e| match e {
            ClientEvent::Request { request, .. } => Some(request),
            _ => None,
        })
        .context("right peer never saw the request")?;
    let op_right = svc.accept(request, set_right, job.mode, job.options)?;
    let steps = net.run()?;
    debug!(steps, "network settled");

    let left_events = net.service_mut(left).context("left peer missing")?.take_events();
    let right_events = net.service_mut(right).context("right peer missing")?.take_events();
    let report = Report {
        left: report_from(&left_events, op_left)?,
        right: report_from(&right_events, op_right)?,
        frames: Some(net.frames_delivered()),
        bytes: Some(net.bytes_delivered()),
    };
    info!(frames = net.frames_delivered(), bytes = net.bytes_delivered(), "sync run complete");
    Ok(report)
}

async fn wait_for_terminal(
    events: &mut UnboundedReceiver<ClientEvent>,
    op: OperationId,
) -> Result<Vec<ClientEvent>> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let done = matches!(
            &event,
            ClientEvent::Result { operation, element: None, .. } if *operation == op
        );
        seen.push(event);
        if done {
            return Ok(seen);
        }
    }
    bail!("event stream ended before {op} finished")
}

/// Runs the job on two async nodes connected by in-memory streams.
pub async fn run_async(job: &Job) -> Result<Report> {
    let app = AppId::from_name(APP_NAME);
    let hub = MemoryHub::new();
    let (left, mut left_events) =
        spawn(SetService::new(PeerId::new(), job.config.clone())?, hub.clone()).await;
    let (right, mut right_events) =
        spawn(SetService::new(PeerId::new(), job.config.clone())?, hub.clone()).await;

    let set_right = right
        .call(|svc| -> Result<_> {
            let set = populate(svc, job, &job.right)?;
            svc.listen(job.op_type, app)?;
            Ok(set)
        })
        .await?;
    let to = right.peer();
    let op_left = left
        .call(|svc| -> Result<_> {
            let set = populate(svc, job, &job.left)?;
            Ok(svc.evaluate(set, to, app, None, job.mode, job.options)?)
        })
        .await?;

    let exchange = async {
        let request = loop {
            match right_events.recv().await {
                Some(ClientEvent::Request { request, .. }) => break request,
                Some(_) => continue,
                None => bail!("right peer stopped before the request arrived"),
            }
        };
        let op_right = right
            .call(|svc| svc.accept(request, set_right, job.mode, job.options))
            .await?;
        let left_seen = wait_for_terminal(&mut left_events, op_left).await?;
        let right_seen = wait_for_terminal(&mut right_events, op_right).await?;
        Ok::<_, anyhow::Error>(Report {
            left: report_from(&left_seen, op_left)?,
            right: report_from(&right_seen, op_right)?,
            frames: None,
            bytes: None,
        })
    };
    let report = tokio::time::timeout(job.timeout, exchange)
        .await
        .context("reconciliation timed out")?;

    left.shutdown().await;
    right.shutdown().await;
    info!("async run complete");
    report
}
