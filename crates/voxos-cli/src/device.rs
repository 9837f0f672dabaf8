//! Stand-in device services.
//!
//! On a device, text-to-speech, lighting and media playback are separate
//! services.  Here they are registered as capabilities that log the call and
//! acknowledge it, so applications can exercise the invocation path end to
//! end.  The cloud skill host is an in-process app that logs the requests
//! routed to it.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::info;
use voxos_runtime::capability::{CapabilityRegistry, InvocationContext};
use voxos_runtime::launcher::LightApp;
use voxos_runtime::types::LIFECYCLE_NAMESPACE;
use voxos_runtime::{AppBridge, Result, RuntimeError};

/// Registry with `tts.speak`, `light.play` and `media.play`.
pub fn capabilities() -> CapabilityRegistry {
    let registry = CapabilityRegistry::new();

    registry.register("tts", "speak", |ctx: InvocationContext| async move {
        let Some(text) = ctx.args.get("text").and_then(Value::as_str) else {
            return Err(RuntimeError::CapabilityFailed {
                namespace: "tts".into(),
                method: "speak".into(),
                reason: "missing `text`".into(),
            });
        };
        info!(app_id = %ctx.app_id, text, "tts.speak");
        Ok(json!({ "spoken": true }))
    });

    registry.register("light", "play", |ctx: InvocationContext| async move {
        info!(app_id = %ctx.app_id, args = %ctx.args, "light.play");
        Ok(json!({ "played": true }))
    });

    registry.register("media", "play", |ctx: InvocationContext| async move {
        let url = ctx.args.get("url").and_then(Value::as_str).unwrap_or_default();
        info!(app_id = %ctx.app_id, url, "media.play");
        Ok(json!({ "played": true }))
    });

    registry
}

/// In-process host of cloud skills.
pub struct CloudHost;

impl LightApp for CloudHost {
    fn attach(&self, bridge: &Arc<AppBridge>, mode: &str) -> Result<()> {
        info!(mode, "cloud skill host attached");
        bridge.subscribe(
            LIFECYCLE_NAMESPACE,
            "request",
            Arc::new(|nlu: &Value| {
                let skill = nlu.get("appId").and_then(Value::as_str).unwrap_or_default();
                let intent = nlu.get("intent").and_then(Value::as_str).unwrap_or_default();
                info!(skill, intent, "cloud request");
                Ok(())
            }),
        );
        Ok(())
    }
}
