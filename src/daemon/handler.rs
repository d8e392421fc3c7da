//! Request dispatch
//!
//! Maps a decoded request onto the manager. The handler never looks inside
//! a failure; it only forwards the error text.

use serde_json::Value;

use crate::manager::{Manager, ManagerError};
use crate::protocol::{Function, Request, Response};

/// Handle one request line and produce the encoded response line
pub fn handle_line(manager: &mut Manager, line: &str) -> String {
    let request = Request::parse(line);
    let response = handle_request(manager, &request);
    response.to_line().unwrap_or_else(|e| {
        log::warn!("Failed to encode response: {}", e);
        "{\"Status\":\"error\"}\n".to_string()
    })
}

/// Handle a decoded request
pub fn handle_request(manager: &mut Manager, request: &Request) -> Response {
    let function = match request.function() {
        Ok(function) => function,
        Err(e) => return Response::error(e.to_string()),
    };
    let service = request.service();
    log::debug!("Request: {} {}", function, service);

    match dispatch(manager, function, service) {
        Ok(Some(value)) => Response::ok_with(value),
        Ok(None) => Response::ok(),
        Err(e) => {
            log::debug!("{} {} failed: {}", function, service, e);
            Response::error(e.to_string())
        }
    }
}

fn dispatch(
    manager: &mut Manager,
    function: Function,
    service: &str,
) -> Result<Option<Value>, ManagerError> {
    match function {
        Function::Disable => manager.disable(service)?,
        Function::Enable => manager.enable(service)?,
        Function::Reload => manager.reload(service)?,
        Function::Restart => manager.restart(service)?,
        Function::Start => manager.start(service)?,
        Function::Stop => manager.stop(service)?,
        Function::List if service.is_empty() => {
            let all = manager
                .list_all()
                .into_iter()
                .map(|(name, status)| (name, Value::String(status.to_string())))
                .collect();
            return Ok(Some(Value::Object(all)));
        }
        Function::List => {
            let status = manager.list(service)?;
            return Ok(Some(Value::String(status.to_string())));
        }
    }
    Ok(None)
}
