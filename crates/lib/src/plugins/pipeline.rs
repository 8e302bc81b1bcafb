//! Ordered execution of plugin hooks with merge and short-circuit rules.
//!
//! Hooks run strictly sequentially — plugins may depend on the output of
//! earlier ones. The accumulator starts empty; the first contributing hook's
//! response is taken wholesale, later contributions merge field by field.
//!
//! Merge rules (Before phase): `modified_request` overwrites only when
//! non-empty, `custom_response` entries append in invocation order, and
//! `terminate_request` takes the latest hook's value — last writer wins, it
//! is deliberately NOT OR'd across plugins. A later hook returning
//! `terminate_request: false` therefore clears an earlier hook's `true`.

use super::{AfterRequest, AfterResponse, BeforeRequest, BeforeResponse, PluginEntry};

#[derive(Debug, thiserror::Error)]
#[error("plugin {plugin} failed: {source}")]
pub struct PluginError {
    pub plugin: String,
    #[source]
    pub source: anyhow::Error,
}

/// Run the Before phase. Returns `None` when no plugin contributed.
///
/// A hook error aborts the phase unless the entry's `ignore_if_error` is
/// set, in which case the hook's output is discarded and iteration
/// continues. Gating: entries lacking `allowed_to_terminate_plugins` (resp.
/// `allowed_to_terminate_request`) force the accumulator's flag to false
/// before it is acted on. A gated `terminate_plugins` stops iteration
/// immediately.
pub async fn run_before(
    entries: &[PluginEntry],
    req: &BeforeRequest,
) -> Result<Option<BeforeResponse>, PluginError> {
    let mut result: Option<BeforeResponse> = None;
    for entry in entries {
        let hook = match entry.plugin.as_before() {
            Some(h) => h,
            None => continue,
        };
        log::debug!("executing plugin {} (before)", entry.plugin.name());
        let r = match hook.execute_before(req).await {
            Ok(r) => r,
            Err(e) => {
                if entry.ignore_if_error {
                    log::warn!("plugin {} failed, ignored: {}", entry.plugin.name(), e);
                    continue;
                }
                return Err(PluginError {
                    plugin: entry.plugin.name().to_string(),
                    source: e,
                });
            }
        };
        match result.as_mut() {
            None => result = Some(r),
            Some(acc) => {
                if !r.modified_request.is_empty() {
                    acc.modified_request = r.modified_request;
                }
                acc.custom_response.extend(r.custom_response);
                // Last writer wins; terminate_plugins is deliberately not
                // merged once an accumulator exists.
                acc.terminate_request = r.terminate_request;
            }
        }
        let acc = result.as_mut().unwrap();
        if !entry.allowed_to_terminate_plugins {
            acc.terminate_plugins = false;
        }
        if !entry.allowed_to_terminate_request {
            acc.terminate_request = false;
        }
        if acc.terminate_plugins {
            break;
        }
    }
    Ok(result)
}

/// Run the After phase over a completed turn. Same shape as the Before
/// phase, merging only `modified_response` (overwrite when non-empty) and
/// short-circuiting only on a gated `terminate_plugins`.
pub async fn run_after(
    entries: &[PluginEntry],
    req: &AfterRequest,
) -> Result<Option<AfterResponse>, PluginError> {
    let mut result: Option<AfterResponse> = None;
    for entry in entries {
        let hook = match entry.plugin.as_after() {
            Some(h) => h,
            None => continue,
        };
        log::debug!("executing plugin {} (after)", entry.plugin.name());
        let r = match hook.execute_after(req).await {
            Ok(r) => r,
            Err(e) => {
                if entry.ignore_if_error {
                    log::warn!("plugin {} failed, ignored: {}", entry.plugin.name(), e);
                    continue;
                }
                return Err(PluginError {
                    plugin: entry.plugin.name().to_string(),
                    source: e,
                });
            }
        };
        match result.as_mut() {
            None => result = Some(r),
            Some(acc) => {
                if !r.modified_response.is_empty() {
                    acc.modified_response = r.modified_response;
                }
            }
        }
        let acc = result.as_mut().unwrap();
        if !entry.allowed_to_terminate_plugins {
            acc.terminate_plugins = false;
        }
        if acc.terminate_plugins {
            break;
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TurnStatus;
    use crate::plugins::{AfterHook, BeforeHook, Plugin};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Test plugin returning scripted responses (or an error) per phase.
    struct Scripted {
        name: String,
        before: Option<Result<BeforeResponse, String>>,
        after: Option<Result<AfterResponse, String>>,
    }

    impl Scripted {
        fn before(name: &str, resp: BeforeResponse) -> Self {
            Self {
                name: name.to_string(),
                before: Some(Ok(resp)),
                after: None,
            }
        }

        fn before_err(name: &str) -> Self {
            Self {
                name: name.to_string(),
                before: Some(Err("boom".to_string())),
                after: None,
            }
        }

        fn after(name: &str, resp: AfterResponse) -> Self {
            Self {
                name: name.to_string(),
                before: None,
                after: Some(Ok(resp)),
            }
        }
    }

    #[async_trait]
    impl BeforeHook for Scripted {
        async fn execute_before(&self, _req: &BeforeRequest) -> anyhow::Result<BeforeResponse> {
            match self.before.as_ref().unwrap() {
                Ok(r) => Ok(r.clone()),
                Err(e) => Err(anyhow::anyhow!(e.clone())),
            }
        }
    }

    #[async_trait]
    impl AfterHook for Scripted {
        async fn execute_after(&self, _req: &AfterRequest) -> anyhow::Result<AfterResponse> {
            match self.after.as_ref().unwrap() {
                Ok(r) => Ok(r.clone()),
                Err(e) => Err(anyhow::anyhow!(e.clone())),
            }
        }
    }

    impl Plugin for Scripted {
        fn name(&self) -> &str {
            &self.name
        }
        fn as_before(&self) -> Option<&dyn BeforeHook> {
            self.before.as_ref().map(|_| self as &dyn BeforeHook)
        }
        fn as_after(&self) -> Option<&dyn AfterHook> {
            self.after.as_ref().map(|_| self as &dyn AfterHook)
        }
    }

    fn entry(plugin: Scripted) -> PluginEntry {
        PluginEntry {
            plugin: Arc::new(plugin),
            ignore_if_error: false,
            allowed_to_terminate_plugins: true,
            allowed_to_terminate_request: true,
        }
    }

    fn req() -> BeforeRequest {
        BeforeRequest {
            content: "hi".to_string(),
            conv_key: "c1".to_string(),
            ..Default::default()
        }
    }

    fn turn() -> AfterRequest {
        AfterRequest {
            id: 1,
            conversation_id: "conv-1".to_string(),
            request: "hi".to_string(),
            response: "hello".to_string(),
            status: TurnStatus::Completed,
            is_plugin_custom_response: false,
            response_modified: false,
        }
    }

    #[tokio::test]
    async fn before_no_plugins_yields_none() {
        let out = run_before(&[], &req()).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn before_custom_responses_append_in_order() {
        let entries = vec![
            entry(Scripted::before(
                "a",
                BeforeResponse {
                    custom_response: vec!["x".to_string()],
                    ..Default::default()
                },
            )),
            entry(Scripted::before(
                "b",
                BeforeResponse {
                    custom_response: vec!["y".to_string()],
                    ..Default::default()
                },
            )),
        ];
        let out = run_before(&entries, &req()).await.unwrap().unwrap();
        assert_eq!(out.custom_response, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn before_modified_request_overwrites_only_when_non_empty() {
        let entries = vec![
            entry(Scripted::before(
                "a",
                BeforeResponse {
                    modified_request: "rewritten".to_string(),
                    ..Default::default()
                },
            )),
            entry(Scripted::before("b", BeforeResponse::default())),
        ];
        let out = run_before(&entries, &req()).await.unwrap().unwrap();
        assert_eq!(out.modified_request, "rewritten");
    }

    #[tokio::test]
    async fn before_terminate_request_last_writer_wins() {
        // Deliberately not OR'd: the second plugin's `false` clears the
        // first plugin's `true`.
        let entries = vec![
            entry(Scripted::before(
                "a",
                BeforeResponse {
                    terminate_request: true,
                    ..Default::default()
                },
            )),
            entry(Scripted::before("b", BeforeResponse::default())),
        ];
        let out = run_before(&entries, &req()).await.unwrap().unwrap();
        assert!(!out.terminate_request);
    }

    #[tokio::test]
    async fn before_terminate_request_gated_when_not_allowed() {
        let mut e = entry(Scripted::before(
            "a",
            BeforeResponse {
                terminate_request: true,
                ..Default::default()
            },
        ));
        e.allowed_to_terminate_request = false;
        let out = run_before(&[e], &req()).await.unwrap().unwrap();
        assert!(!out.terminate_request);
    }

    #[tokio::test]
    async fn before_terminate_plugins_stops_iteration() {
        let entries = vec![
            entry(Scripted::before(
                "a",
                BeforeResponse {
                    terminate_plugins: true,
                    custom_response: vec!["only".to_string()],
                    ..Default::default()
                },
            )),
            entry(Scripted::before(
                "never",
                BeforeResponse {
                    custom_response: vec!["skipped".to_string()],
                    ..Default::default()
                },
            )),
        ];
        let out = run_before(&entries, &req()).await.unwrap().unwrap();
        assert_eq!(out.custom_response, vec!["only"]);
    }

    #[tokio::test]
    async fn before_terminate_plugins_gated_continues() {
        let mut first = entry(Scripted::before(
            "a",
            BeforeResponse {
                terminate_plugins: true,
                ..Default::default()
            },
        ));
        first.allowed_to_terminate_plugins = false;
        let entries = vec![
            first,
            entry(Scripted::before(
                "b",
                BeforeResponse {
                    custom_response: vec!["ran".to_string()],
                    ..Default::default()
                },
            )),
        ];
        let out = run_before(&entries, &req()).await.unwrap().unwrap();
        assert_eq!(out.custom_response, vec!["ran"]);
    }

    #[tokio::test]
    async fn before_later_terminate_plugins_does_not_stop_existing_accumulator() {
        // Once an accumulator exists, a later plugin's terminate_plugins is
        // not merged and cannot stop the chain.
        let entries = vec![
            entry(Scripted::before("a", BeforeResponse::default())),
            entry(Scripted::before(
                "b",
                BeforeResponse {
                    terminate_plugins: true,
                    ..Default::default()
                },
            )),
            entry(Scripted::before(
                "c",
                BeforeResponse {
                    custom_response: vec!["still-ran".to_string()],
                    ..Default::default()
                },
            )),
        ];
        let out = run_before(&entries, &req()).await.unwrap().unwrap();
        assert_eq!(out.custom_response, vec!["still-ran"]);
    }

    #[tokio::test]
    async fn before_error_aborts_phase() {
        let entries = vec![entry(Scripted::before_err("a"))];
        let err = run_before(&entries, &req()).await.unwrap_err();
        assert_eq!(err.plugin, "a");
    }

    #[tokio::test]
    async fn before_error_ignored_skips_output() {
        let mut failing = entry(Scripted::before_err("a"));
        failing.ignore_if_error = true;
        let entries = vec![
            failing,
            entry(Scripted::before(
                "b",
                BeforeResponse {
                    custom_response: vec!["ok".to_string()],
                    ..Default::default()
                },
            )),
        ];
        let out = run_before(&entries, &req()).await.unwrap().unwrap();
        assert_eq!(out.custom_response, vec!["ok"]);
    }

    #[tokio::test]
    async fn before_skips_plugins_without_capability() {
        let entries = vec![
            entry(Scripted::after("after-only", AfterResponse::default())),
            entry(Scripted::before(
                "b",
                BeforeResponse {
                    custom_response: vec!["ran".to_string()],
                    ..Default::default()
                },
            )),
        ];
        let out = run_before(&entries, &req()).await.unwrap().unwrap();
        assert_eq!(out.custom_response, vec!["ran"]);
    }

    #[tokio::test]
    async fn after_empty_modified_response_keeps_earlier_value() {
        let entries = vec![
            entry(Scripted::after(
                "a",
                AfterResponse {
                    modified_response: "kept".to_string(),
                    ..Default::default()
                },
            )),
            entry(Scripted::after("b", AfterResponse::default())),
        ];
        let out = run_after(&entries, &turn()).await.unwrap().unwrap();
        assert_eq!(out.modified_response, "kept");
    }

    #[tokio::test]
    async fn after_terminate_plugins_stops_iteration() {
        let entries = vec![
            entry(Scripted::after(
                "a",
                AfterResponse {
                    terminate_plugins: true,
                    modified_response: "first".to_string(),
                },
            )),
            entry(Scripted::after(
                "b",
                AfterResponse {
                    modified_response: "second".to_string(),
                    ..Default::default()
                },
            )),
        ];
        let out = run_after(&entries, &turn()).await.unwrap().unwrap();
        assert_eq!(out.modified_response, "first");
    }

    #[tokio::test]
    async fn after_no_capable_plugins_yields_none() {
        let entries = vec![entry(Scripted::before("a", BeforeResponse::default()))];
        let out = run_after(&entries, &turn()).await.unwrap();
        assert!(out.is_none());
    }
}
