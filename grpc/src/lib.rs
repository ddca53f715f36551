#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The per-request processing engine, served over the Envoy external
//! processor protocol.

mod engine;
mod vars;

use customrouter_core::RouteLookup;
use envoy_types::pb::envoy::service::ext_proc::v3::{
    external_processor_server::{ExternalProcessor, ExternalProcessorServer},
    ProcessingRequest, ProcessingResponse,
};
use futures::Stream;
use std::{pin::Pin, sync::Arc};
use tonic::{Request, Response, Status, Streaming};

#[derive(Clone, Debug)]
pub struct ExtProcServer<T> {
    lookup: Arc<T>,
    access_log: bool,
    drain: drain::Watch,
}

// === impl ExtProcServer ===

impl<T> ExtProcServer<T>
where
    T: RouteLookup + 'static,
{
    pub fn new(lookup: T, access_log: bool, drain: drain::Watch) -> Self {
        Self {
            lookup: Arc::new(lookup),
            access_log,
            drain,
        }
    }

    pub fn svc(self) -> ExternalProcessorServer<Self> {
        ExternalProcessorServer::new(self)
    }
}

type BoxProcessStream =
    Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl<T> ExternalProcessor for ExtProcServer<T>
where
    T: RouteLookup + 'static,
{
    type ProcessStream = BoxProcessStream;

    async fn process(
        &self,
        req: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let mut messages = req.into_inner();
        let lookup = self.lookup.clone();
        let access_log = self.access_log;
        let drain = self.drain.clone();

        let stream: BoxProcessStream = Box::pin(async_stream::try_stream! {
            tokio::pin! {
                let shutdown = drain.signaled();
            }

            loop {
                // The `?` below must live outside the `select!` invocation:
                // async-stream only rewrites `?` in statements it parses
                // directly, not inside the token stream of a nested macro.
                let msg = tokio::select! {
                    msg = messages.message() => Some(msg),

                    // On shutdown, close the stream so it doesn't hold the
                    // server open past the drain deadline.
                    _ = (&mut shutdown) => None,
                };
                let Some(msg) = msg else {
                    return;
                };
                match msg? {
                    Some(req) => {
                        if let Some(rsp) = engine::handle_message(&*lookup, req, access_log) {
                            yield rsp;
                        }
                    }
                    None => return,
                }
            }
        });
        Ok(Response::new(stream))
    }
}
