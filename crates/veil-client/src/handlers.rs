//! Requests the router relays to us over the tunnel.

use std::sync::Arc;

use tracing::{debug, info, warn};
use veil_shared::envelope::Request;
use veil_shared::protocol::{
    BrowseRequest, BrowseResponse, PingResponse, SearchRequest, SearchResponse, TransferRequest,
};
use veil_shared::{Payload, Status, VeilError};

use crate::config::ClientConfig;
use crate::connection::RouterConnection;
use crate::error::ClientError;
use crate::events::{ClientEvent, EventSink};
use crate::share::ShareStore;
use crate::transfer;

pub(crate) struct Handlers {
    pub config: Arc<ClientConfig>,
    pub store: Arc<dyn ShareStore>,
    pub events: EventSink,
}

impl Handlers {
    /// Answer relayed requests until the tunnel fails or closes.
    pub async fn serve(self: Arc<Self>, mut tunnel: RouterConnection) {
        loop {
            let (request, payloads) = match tunnel.next_request().await {
                Ok(Some(next)) => next,
                Ok(None) => {
                    info!("Router closed the tunnel");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Tunnel read failed");
                    return;
                }
            };
            let (status, answer) = self.dispatch(&request, payloads).await;
            if let Err(e) = tunnel.respond(status, &answer).await {
                warn!(error = %e, "Tunnel write failed");
                return;
            }
        }
    }

    pub async fn dispatch(&self, request: &Request, payloads: Vec<Payload>) -> (Status, Vec<Payload>) {
        let mut answer = Vec::new();
        for payload in payloads {
            match self.handle(request, payload).await {
                Ok(Some(reply)) => answer.push(reply),
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, "Relayed request failed");
                    return (e.status(), Vec::new());
                }
            }
        }
        (Status::Ok, answer)
    }

    async fn handle(&self, request: &Request, payload: Payload) -> Result<Option<Payload>, ClientError> {
        match payload {
            Payload::PingRequest(_) => Ok(Some(Payload::PingResponse(PingResponse::default()))),
            Payload::SearchRequest(req) => self.search(req).await.map(Some),
            Payload::BrowseRequest(req) => self.browse(req).await.map(Some),
            Payload::TransferRequest(req) => self.transfer(req).await.map(|()| None),
            Payload::ChatRequest(message) => {
                self.events.post(ClientEvent::Chat {
                    from: request.origin,
                    private: !request.targets.is_empty(),
                    message,
                });
                Ok(None)
            }
            Payload::Info(event) => {
                self.events.post(ClientEvent::Member(event));
                Ok(None)
            }
            Payload::SearchResponse(result) => {
                self.events.post(ClientEvent::SearchResult {
                    from: request.origin,
                    keyword: result.keyword,
                    files: result.files,
                });
                Ok(None)
            }
            other => Err(VeilError::validation(format!("{:?} is not relayed to clients", other.kind())).into()),
        }
    }

    fn require_share(&self) -> Result<(), ClientError> {
        if self.config.share {
            Ok(())
        } else {
            Err(VeilError::Unsupported("not sharing files".into()).into())
        }
    }

    async fn search(&self, req: SearchRequest) -> Result<Payload, ClientError> {
        self.require_share()?;
        req.validate()?;
        let files = self.store.search(&req.keyword).await?;
        debug!(keyword = %req.keyword, hits = files.len(), "Search answered");
        Ok(Payload::SearchResponse(SearchResponse {
            keyword: req.keyword,
            files,
        }))
    }

    async fn browse(&self, req: BrowseRequest) -> Result<Payload, ClientError> {
        self.require_share()?;
        req.validate()?;
        let files = self.store.list(&req.path).await?;
        Ok(Payload::BrowseResponse(BrowseResponse { files }))
    }

    /// Someone wants one of our files: check we have it as described and
    /// start an uploader for it.
    async fn transfer(&self, req: TransferRequest) -> Result<(), ClientError> {
        self.require_share()?;
        req.validate()?;
        match self.store.lookup(&req.file.path).await? {
            Some(file) if file.size == req.file.size => {
                info!(transfer = %req.transfer, path = %file.path, "Upload requested");
                tokio::spawn(transfer::upload(
                    self.config.clone(),
                    self.store.clone(),
                    self.events.clone(),
                    req.transfer,
                    file,
                ));
                Ok(())
            }
            _ => Err(VeilError::not_found(format!("no shared file {} of that size", req.file.path)).into()),
        }
    }
}
