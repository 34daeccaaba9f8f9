use gcplog_rs::{Config, RequestInfo, ResponseMeta};
use tiny_http::{Response, Server};
use tracing::info;

struct Reply {
    status: u16,
    body: String,
}

impl Reply {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

impl ResponseMeta for Reply {
    fn status(&self) -> u16 {
        self.status
    }

    fn response_size(&self) -> Option<u64> {
        Some(self.body.len() as u64)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Project id, service and level come from the environment; missing values
    // are looked up on the metadata server.
    let pipeline = gcplog_rs::init(Config::from_env()?)?;
    let requests = pipeline.request_log();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let server = Server::http(format!("0.0.0.0:{port}"))?;
    info!("Server listening on 0.0.0.0:{port}");

    for request in server.incoming_requests() {
        let info = RequestInfo {
            method: request.method().to_string(),
            url: request.url().to_string(),
            headers: request
                .headers()
                .iter()
                .map(|h| (h.field.to_string(), h.value.to_string()))
                .collect(),
            peer_addr: request.remote_addr().map(|addr| addr.ip().to_string()),
            request_size: request.body_length().map(|n| n as u64),
        };

        let result = requests.handle(&info, |logger| {
            gcplog_rs::info!(logger, "Start. {} {}", info.method, info.url);
            let reply = match info.url.as_str() {
                "/" => {
                    logger.log(gcplog_rs::Severity::Critical, "hello log!!");
                    Reply::new(418, "Index!")
                }
                "/hello" => {
                    for severity in gcplog_rs::Severity::ALL {
                        logger.log(severity, severity.as_str());
                    }
                    Reply::new(200, "Hello, World!")
                }
                "/_ah/warmup" => Reply::new(204, ""),
                "/panic" => return logger.panic("panic requested"),
                _ => Reply::new(404, "Not Found"),
            };
            logger.info("End.");
            Ok(reply)
        });

        let reply = result.unwrap_or_else(|err| Reply::new(err.status(), err.to_string()));
        let response = Response::from_string(reply.body).with_status_code(reply.status);
        if let Err(e) = request.respond(response) {
            tracing::error!(error = ?e, "failed to send response");
        }
    }

    pipeline.shutdown()?;
    Ok(())
}
