use domhost_process::Outbound;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
};
use tracing::{Instrument, info_span};

use crate::rpc::{self, AgentRpc};

#[derive(Debug, Clone, serde::Deserialize)]
struct RequestFrame {
    id: String,
    trigger: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
enum ResponseFrame {
    #[serde(rename = "resp")]
    Resp {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

fn event_line(msg: &Outbound) -> anyhow::Result<String> {
    let mut v = serde_json::to_value(msg)?;
    if let Some(obj) = v.as_object_mut() {
        obj.insert("type".to_string(), Value::String("event".to_string()));
    }
    Ok(serde_json::to_string(&v)?)
}

async fn handle_line(rpc: &AgentRpc, line: &str) -> ResponseFrame {
    let req = match serde_json::from_str::<RequestFrame>(line) {
        Ok(req) => req,
        Err(e) => {
            return ResponseFrame::Resp {
                id: String::new(),
                ok: false,
                payload: None,
                error: Some(crate::error_payload::encode(
                    crate::error_payload::INVALID_PARAM,
                    format!("invalid request frame: {e}"),
                    None,
                )),
            };
        }
    };

    let span = info_span!("request", id = %req.id, trigger = %req.trigger);
    async move {
        match rpc.dispatch(&req.trigger, req.payload).await {
            Ok(payload) => ResponseFrame::Resp {
                id: req.id,
                ok: true,
                payload: Some(payload),
                error: None,
            },
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "request failed");
                ResponseFrame::Resp {
                    id: req.id,
                    ok: false,
                    payload: None,
                    error: Some(rpc::encode_error(&e)),
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Serves line-delimited JSON requests until `input` reaches EOF.
///
/// Requests run concurrently; responses and outbound events share one
/// writer so lines never interleave.
pub async fn run<R, W>(
    input: R,
    output: W,
    rpc: AgentRpc,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(mut line) = line_rx.recv().await {
            line.push('\n');
            output.write_all(line.as_bytes()).await?;
            output.flush().await?;
        }
        anyhow::Ok(())
    });

    let events = tokio::spawn({
        let line_tx = line_tx.clone();
        async move {
            while let Some(msg) = outbound.recv().await {
                match event_line(&msg) {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(trigger = msg.trigger(), error = %e, "failed to encode event"),
                }
            }
        }
    });

    let mut lines = BufReader::new(input).lines();
    let mut in_flight = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let rpc = rpc.clone();
        let line_tx = line_tx.clone();
        in_flight.push(tokio::spawn(async move {
            let resp = handle_line(&rpc, &line).await;
            match serde_json::to_string(&resp) {
                Ok(out) => {
                    let _ = line_tx.send(out);
                }
                Err(e) => tracing::error!(error = %e, "failed to encode response"),
            }
        }));
        in_flight.retain(|h| !h.is_finished());
    }

    tracing::info!("coordinator input closed");
    futures_util::future::join_all(in_flight).await;
    events.abort();
    let _ = events.await;
    drop(line_tx);
    match writer.await {
        Ok(res) => res,
        Err(e) => Err(anyhow::anyhow!("stdio writer task failed: {e}")),
    }
}
