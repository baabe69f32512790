//! Dispatches a parsed [`bitbabbler_rpc::Request`] against the source
//! registry and logging handle, producing the [`bitbabbler_rpc::Response`]
//! to write back.

use bitbabbler_rpc::{Command, Request, Response, Value};

use crate::logging::VerbosityHandle;
use crate::registry::SourceRegistry;

pub fn handle_request(req: &Request, registry: &SourceRegistry, verbosity: &VerbosityHandle) -> Response {
    let Some(command) = req.command() else {
        return Response::unknown(req.token, &req.raw);
    };

    match command {
        Command::GetIds => Response::get_ids(req.token, registry.ids()),
        Command::ReportStats => report_stats(req, registry),
        Command::GetRawData => raw_data(req, registry),
        Command::SetLogVerbosity => set_log_verbosity(req, verbosity),
    }
}

fn source_arg(req: &Request) -> Option<&str> {
    req.args.first().and_then(|v| v.as_str())
}

/// The source id argument is optional: present, it reports on just that
/// source; absent, it reports on every registered source. Either way the
/// payload is an object keyed by source id, `{id: {...}, ...}`.
fn report_stats(req: &Request, registry: &SourceRegistry) -> Response {
    match source_arg(req) {
        Some(id) => match registry.get(id) {
            Some(monitor) => Response::report_stats(req.token, Value::object_from([(id, monitor.lock().stats_value())])),
            None => Response::new("BadRequest", req.token, bad_request_payload("no such source", &req.raw)),
        },
        None => {
            let entries = registry.ids().into_iter().filter_map(|id| {
                let monitor = registry.get(&id)?;
                Some((id, monitor.lock().stats_value()))
            });
            Response::report_stats(req.token, Value::object_from(entries))
        }
    }
}

fn raw_data(req: &Request, registry: &SourceRegistry) -> Response {
    match source_arg(req) {
        Some(id) => match registry.get(id) {
            Some(monitor) => Response::raw_data(req.token, Value::object_from([(id, monitor.lock().raw_data_value())])),
            None => Response::new("BadRequest", req.token, bad_request_payload("no such source", &req.raw)),
        },
        None => {
            let entries = registry.ids().into_iter().filter_map(|id| {
                let monitor = registry.get(&id)?;
                Some((id, monitor.lock().raw_data_value()))
            });
            Response::raw_data(req.token, Value::object_from(entries))
        }
    }
}

fn set_log_verbosity(req: &Request, verbosity: &VerbosityHandle) -> Response {
    let level = match req.args.first().and_then(|v| v.as_i64()) {
        Some(l) => l,
        None => return Response::new("BadRequest", req.token, bad_request_payload("missing level", &req.raw)),
    };
    match verbosity.set_level(level) {
        Ok(()) => Response::set_log_verbosity(req.token, level),
        Err(e) => Response::new("BadRequest", req.token, bad_request_payload(&e.to_string(), &req.raw)),
    }
}

fn bad_request_payload(message: &str, request: &str) -> bitbabbler_rpc::Value {
    let mut payload = bitbabbler_rpc::Value::object();
    payload.insert("Error", message);
    payload.insert("Request", request);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitbabbler_core::HealthMonitor;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn verbosity() -> VerbosityHandle {
        VerbosityHandle::for_test()
    }

    #[test]
    fn get_ids_lists_registered_sources() {
        let mut registry = SourceRegistry::new();
        registry.register("S-1", Arc::new(Mutex::new(HealthMonitor::new(1_000_000))));
        let req = Request::parse(r#""GetIDs""#).unwrap();
        let resp = handle_request(&req, &registry, &verbosity());
        assert_eq!(resp.name, "GetIDs");
    }

    #[test]
    fn report_stats_on_unknown_source_is_bad_request() {
        let registry = SourceRegistry::new();
        let req = Request::parse(r#"["ReportStats", 1, "nope"]"#).unwrap();
        let resp = handle_request(&req, &registry, &verbosity());
        assert_eq!(resp.name, "BadRequest");
    }

    #[test]
    fn unknown_command_yields_unknown_request() {
        let registry = SourceRegistry::new();
        let req = Request::parse(r#"["Frobnicate", 1]"#).unwrap();
        let resp = handle_request(&req, &registry, &verbosity());
        assert_eq!(resp.name, "UnknownRequest");
    }

    #[test]
    fn report_stats_with_id_keys_payload_by_source_id() {
        let mut registry = SourceRegistry::new();
        registry.register("S-1", Arc::new(Mutex::new(HealthMonitor::new(1_000_000))));
        let req = Request::parse(r#"["ReportStats", 1, "S-1"]"#).unwrap();
        let mut resp = handle_request(&req, &registry, &verbosity());
        assert_eq!(resp.name, "ReportStats");
        let obj = resp.payload.as_object_mut().cloned().expect("object payload");
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("S-1"));
    }

    #[test]
    fn report_stats_without_id_reports_every_source() {
        let mut registry = SourceRegistry::new();
        registry.register("S-1", Arc::new(Mutex::new(HealthMonitor::new(1_000_000))));
        registry.register("S-2", Arc::new(Mutex::new(HealthMonitor::new(1_000_000))));
        let req = Request::parse(r#"["ReportStats", 1]"#).unwrap();
        let mut resp = handle_request(&req, &registry, &verbosity());
        assert_eq!(resp.name, "ReportStats");
        let obj = resp.payload.as_object_mut().cloned().expect("object payload");
        assert_eq!(obj.len(), 2);
        assert!(obj.contains_key("S-1"));
        assert!(obj.contains_key("S-2"));
    }

    #[test]
    fn raw_data_without_id_reports_every_source() {
        let mut registry = SourceRegistry::new();
        registry.register("S-1", Arc::new(Mutex::new(HealthMonitor::new(1_000_000))));
        let req = Request::parse(r#""GetRawData""#).unwrap();
        let mut resp = handle_request(&req, &registry, &verbosity());
        assert_eq!(resp.name, "GetRawData");
        let obj = resp.payload.as_object_mut().cloned().expect("object payload");
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("S-1"));
    }
}
