use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use opendum_protocol::canonical::{CanonicalEvent, CanonicalRequest, TokenUsage};
use opendum_protocol::error::{AnthropicErrorEnvelope, ErrorDetail, ErrorEnvelope, ErrorKind};
use opendum_protocol::sse::{SseDecoder, encode_frame};
use opendum_provider::refresh::REQUEST_REFRESH_BUFFER;
use opendum_provider::{
    EventDecoder, ProviderKind, ProviderRegistry, UpstreamBody, UpstreamResponse,
    UpstreamTransport,
};
use opendum_storage::{AccountRow, AccountStore};
use opendum_translate::aggregate::{AnthropicAggregator, ChatAggregator};
use opendum_translate::emit::{
    AnthropicStreamEncoder, ChatStreamEncoder, ChatStreamItem, ResponsesStreamEncoder,
};
use opendum_translate::ingest::{anthropic_to_canonical, chat_to_canonical, responses_to_canonical};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::auth::CallerIdentity;
use crate::health::{FailureAccountant, sanitized_proxy_error, should_rotate};
use crate::ledger::{RateLimitLedger, format_wait_time, parse_rate_limit_error, parse_retry_after_ms};
use crate::models::ModelTable;
use crate::selector::{AccountSelector, Selection};
use crate::usage::{UsageEvent, UsageRecorder};

const MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Chat,
    Anthropic,
    Responses,
}

#[derive(Debug)]
pub enum ReplyBody {
    Json(Bytes),
    /// Pre-encoded SSE frames.
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct ProxyReply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: ReplyBody,
}

impl ProxyReply {
    fn json(status: u16, body: Bytes) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: ReplyBody::Json(body),
        }
    }

    fn stream(rx: tokio::sync::mpsc::Receiver<Bytes>) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream",
            body: ReplyBody::Stream(rx),
        }
    }
}

/// The per-dialect HTTP entrypoints and the account-selection loop
/// behind them.
pub struct ProxyEngine {
    store: Arc<dyn AccountStore>,
    registry: Arc<ProviderRegistry>,
    credentials: Arc<opendum_provider::CredentialService>,
    ledger: Arc<RateLimitLedger>,
    selector: AccountSelector,
    accountant: Arc<FailureAccountant>,
    usage: UsageRecorder,
    transport: Arc<dyn UpstreamTransport>,
    models: ModelTable,
}

impl ProxyEngine {
    pub fn new(
        store: Arc<dyn AccountStore>,
        registry: Arc<ProviderRegistry>,
        transport: Arc<dyn UpstreamTransport>,
        ledger: Arc<RateLimitLedger>,
    ) -> Self {
        let selector = AccountSelector::new(store.clone(), ledger.clone());
        let credentials = Arc::new(opendum_provider::CredentialService::new(
            store.clone(),
            registry.clone(),
        ));
        let accountant = Arc::new(FailureAccountant::new(store.clone()));
        let usage = UsageRecorder::new(store.clone());
        Self {
            store,
            registry,
            credentials,
            ledger,
            selector,
            accountant,
            usage,
            transport,
            models: ModelTable::new(),
        }
    }

    pub fn credentials(&self) -> Arc<opendum_provider::CredentialService> {
        self.credentials.clone()
    }

    pub fn models(&self) -> &ModelTable {
        &self.models
    }

    pub async fn handle_chat(&self, caller: CallerIdentity, body: Bytes) -> ProxyReply {
        let request = match serde_json::from_slice::<
            opendum_protocol::chat::request::ChatCompletionRequest,
        >(&body)
        {
            Ok(request) => request,
            Err(err) => return bad_request(Dialect::Chat, &err.to_string()),
        };
        let canonical = match chat_to_canonical(request) {
            Ok(canonical) => canonical,
            Err(err) => return bad_request(Dialect::Chat, &err.to_string()),
        };
        self.run(Dialect::Chat, caller, canonical, None).await
    }

    pub async fn handle_anthropic(&self, caller: CallerIdentity, body: Bytes) -> ProxyReply {
        let request = match serde_json::from_slice::<
            opendum_protocol::anthropic::request::MessagesRequest,
        >(&body)
        {
            Ok(request) => request,
            Err(err) => return bad_request(Dialect::Anthropic, &err.to_string()),
        };
        let canonical = match anthropic_to_canonical(request) {
            Ok(canonical) => canonical,
            Err(err) => return bad_request(Dialect::Anthropic, &err.to_string()),
        };
        self.run(Dialect::Anthropic, caller, canonical, None).await
    }

    pub async fn handle_responses(&self, caller: CallerIdentity, body: Bytes) -> ProxyReply {
        let request = match serde_json::from_slice::<
            opendum_protocol::responses::request::ResponsesRequest,
        >(&body)
        {
            Ok(request) => request,
            Err(err) => return bad_request(Dialect::Responses, &err.to_string()),
        };
        let pinned = request.provider_account_id.clone();
        let canonical = match responses_to_canonical(request) {
            Ok(canonical) => canonical,
            Err(err) => return bad_request(Dialect::Responses, &err.to_string()),
        };
        self.run(Dialect::Responses, caller, canonical, pinned).await
    }

    async fn run(
        &self,
        dialect: Dialect,
        caller: CallerIdentity,
        mut canonical: CanonicalRequest,
        pinned: Option<String>,
    ) -> ProxyReply {
        let started = Instant::now();

        // Aliases collapse before anything else looks at the model id.
        let requested = canonical.model.clone();
        let Some(entry) = self.models.resolve(&requested) else {
            return error_reply(
                dialect,
                400,
                ErrorDetail::new(
                    ErrorKind::InvalidRequestError,
                    format!("Unknown model `{requested}`."),
                )
                .with_code("model_not_found"),
            );
        };
        canonical.model = entry.id.to_string();

        if !caller.access.permits(entry.id) && !caller.access.permits(&requested) {
            return error_reply(
                dialect,
                400,
                ErrorDetail::new(
                    ErrorKind::InvalidRequestError,
                    format!("This API key may not use model `{}`.", entry.id),
                )
                .with_code("model_access_denied"),
            );
        }

        match self.store.disabled_models().await {
            Ok(disabled) if disabled.iter().any(|model| model == entry.id) => {
                return error_reply(
                    dialect,
                    400,
                    ErrorDetail::new(
                        ErrorKind::InvalidRequestError,
                        format!("Model `{}` is disabled.", entry.id),
                    )
                    .with_code("model_disabled"),
                );
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "disabled-model lookup failed, continuing"),
        }

        let family = entry.family;

        // A pinned account bypasses rotation entirely.
        let pinned_account = match pinned {
            Some(pin) => match self.load_pinned(dialect, &caller, &pin, entry.id).await {
                Ok(account) => Some(account),
                Err(reply) => return reply,
            },
            None => None,
        };
        if let Some(account) = &pinned_account
            && self.ledger.is_rate_limited(&account.id, family).await
        {
            let wait = self
                .ledger
                .min_wait_ms(std::slice::from_ref(&account.id), family)
                .await;
            return self.rate_limited_reply(dialect, wait);
        }

        let max_attempts = if pinned_account.is_some() {
            1
        } else {
            MAX_ATTEMPTS
        };
        let mut tried: Vec<String> = Vec::new();
        let mut last_failure: Option<u16> = None;
        // One forced refresh-and-retry per account on upstream auth
        // failures, before failure accounting kicks in.
        let mut auth_retry_used: Option<String> = None;
        let mut retry_account: Option<AccountRow> = None;

        for attempt in 0..max_attempts {
            let account = if let Some(account) = retry_account.take() {
                account
            } else if let Some(account) = &pinned_account {
                account.clone()
            } else {
                match self
                    .selector
                    .next_available(&caller.user_id, entry, None, &tried)
                    .await
                {
                    Ok(Selection::Account(account)) => *account,
                    Ok(Selection::RateLimited { mut account_ids }) => {
                        account_ids.extend(self.ledger.rate_limited_ids(&tried, family).await);
                        let wait = self.ledger.min_wait_ms(&account_ids, family).await;
                        return self.rate_limited_reply(dialect, wait);
                    }
                    Ok(Selection::None) => {
                        if tried.is_empty() {
                            return error_reply(
                                dialect,
                                503,
                                ErrorDetail::new(
                                    ErrorKind::ConfigurationError,
                                    "No provider accounts are available for this model.",
                                ),
                            );
                        }
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "account selection failed");
                        return internal_error(dialect);
                    }
                }
            };
            if !tried.contains(&account.id) {
                tried.push(account.id.clone());
            }
            let attempts_remain = attempt + 1 < max_attempts;

            let (credential, account) = match self
                .credentials
                .get_valid_credentials(&account, REQUEST_REFRESH_BUFFER)
                .await
            {
                Ok(pair) => pair,
                Err(err) => {
                    // Refresh failures count as account-level auth errors.
                    self.accountant
                        .mark_failed(&account.id, 401, &err.to_string())
                        .await;
                    last_failure = Some(401);
                    if attempts_remain {
                        continue;
                    }
                    break;
                }
            };

            if let Err(err) = self.store.touch_account_usage(&account.id).await {
                warn!(account = %account.id, error = %err, "usage counter update failed");
            }

            let Some(adapter) = ProviderKind::parse(&account.provider)
                .and_then(|kind| self.registry.get(kind))
            else {
                warn!(account = %account.id, provider = %account.provider, "no adapter registered");
                last_failure = Some(500);
                continue;
            };

            let upstream_req =
                match adapter.build_generate_request(&credential, &canonical, &canonical.model) {
                    Ok(req) => req,
                    Err(err) => {
                        warn!(error = %err, "request projection failed");
                        return internal_error(dialect);
                    }
                };

            let resp = match self.transport.send(upstream_req).await {
                Ok(resp) => resp,
                Err(err) => {
                    self.accountant
                        .mark_failed(&account.id, 502, &err.to_string())
                        .await;
                    last_failure = Some(502);
                    if attempts_remain {
                        continue;
                    }
                    break;
                }
            };

            if resp.status == 429 {
                // Quota exhaustion is a routing signal, not an account
                // fault: record the cool-down and move on silently.
                let body = resp.body_text();
                let parsed = parse_rate_limit_error(&body);
                let retry_ms = parse_retry_after_ms(&resp.headers)
                    .or(parsed.as_ref().map(|parsed| parsed.retry_after_ms))
                    .unwrap_or(3_600_000);
                let (model, message) = parsed
                    .map(|parsed| (parsed.model, parsed.message))
                    .unwrap_or((None, None));
                info!(account = %account.id, family, retry_ms, "upstream rate limit");
                self.ledger
                    .mark_rate_limited(&account.id, family, retry_ms, model, message)
                    .await;
                self.record_usage(&caller, &account, &canonical.model, TokenUsage::default(), 429, started);
                continue;
            }

            if !resp.is_success() {
                // Auth failures get one forced refresh and a retry on the
                // same account; the rotated-out token may simply be stale.
                if matches!(resp.status, 401 | 403)
                    && attempts_remain
                    && auth_retry_used.as_deref() != Some(account.id.as_str())
                    && !account.refresh_token.trim().is_empty()
                {
                    match self.credentials.refresh_account(&account).await {
                        Ok(refreshed) => {
                            info!(account = %account.id, "retrying with refreshed credential after upstream auth failure");
                            auth_retry_used = Some(account.id.clone());
                            retry_account = Some(refreshed);
                            continue;
                        }
                        Err(err) => {
                            warn!(account = %account.id, error = %err, "forced refresh after auth failure did not succeed");
                        }
                    }
                }
                let body = resp.body_text();
                self.accountant
                    .mark_failed(&account.id, resp.status, &body)
                    .await;
                last_failure = Some(resp.status);
                if should_rotate(resp.status) && attempts_remain {
                    info!(account = %account.id, status = resp.status, "rotating after upstream failure");
                    continue;
                }
                let (status, detail) = sanitized_proxy_error(resp.status, None);
                self.record_usage(&caller, &account, &canonical.model, TokenUsage::default(), status, started);
                return error_reply(dialect, status, detail);
            }

            return self
                .pipe_success(dialect, caller, canonical, account, adapter.new_decoder(), resp, started)
                .await;
        }

        // Attempts exhausted without an OK upstream.
        if let Some(upstream_status) = last_failure {
            let (status, detail) = sanitized_proxy_error(upstream_status, None);
            if let Some(account_id) = tried.last() {
                if let Ok(Some(account)) = self.store.account_by_id(account_id).await {
                    self.record_usage(&caller, &account, &canonical.model, TokenUsage::default(), status, started);
                }
            }
            return error_reply(dialect, status, detail);
        }
        let limited = self.ledger.rate_limited_ids(&tried, family).await;
        if !limited.is_empty() {
            let wait = self.ledger.min_wait_ms(&limited, family).await;
            return self.rate_limited_reply(dialect, wait);
        }
        internal_error(dialect)
    }

    async fn load_pinned(
        &self,
        dialect: Dialect,
        caller: &CallerIdentity,
        pin: &str,
        model: &str,
    ) -> Result<AccountRow, ProxyReply> {
        let account = match self.store.account_by_id(pin).await {
            Ok(Some(account)) if account.user_id == caller.user_id => account,
            Ok(_) => {
                return Err(error_reply(
                    dialect,
                    400,
                    ErrorDetail::new(
                        ErrorKind::InvalidRequestError,
                        format!("Provider account `{pin}` was not found."),
                    )
                    .with_code("provider_account_not_found"),
                ));
            }
            Err(err) => {
                warn!(error = %err, "pinned account lookup failed");
                return Err(internal_error(dialect));
            }
        };
        if !account.is_active {
            return Err(error_reply(
                dialect,
                400,
                ErrorDetail::new(
                    ErrorKind::InvalidRequestError,
                    format!("Provider account `{pin}` is disabled."),
                )
                .with_code("provider_account_disabled"),
            ));
        }
        let supported = ProviderKind::parse(&account.provider)
            .map(|kind| {
                self.models
                    .resolve(model)
                    .map(|entry| entry.supported_by(kind))
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if !supported {
            return Err(error_reply(
                dialect,
                400,
                ErrorDetail::new(
                    ErrorKind::InvalidRequestError,
                    format!(
                        "Provider account `{pin}` ({}) does not serve model `{model}`.",
                        account.provider
                    ),
                )
                .with_code("provider_account_model_mismatch"),
            ));
        }
        Ok(account)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pipe_success(
        &self,
        dialect: Dialect,
        caller: CallerIdentity,
        canonical: CanonicalRequest,
        account: AccountRow,
        mut decoder: Box<dyn EventDecoder>,
        resp: UpstreamResponse,
        started: Instant,
    ) -> ProxyReply {
        let model = canonical.model.clone();

        if canonical.stream {
            let mut encoder = ResponseEncoder::new(dialect, &model, canonical.include_reasoning);
            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
            let accountant = self.accountant.clone();
            let usage_recorder = self.usage.clone();
            let account_for_task = account.clone();
            let caller_for_task = caller.clone();

            tokio::spawn(async move {
                let mut sse = SseDecoder::new();
                let mut caller_gone = false;

                match resp.body {
                    UpstreamBody::Stream(mut upstream_rx) => {
                        'read: while let Some(chunk) = upstream_rx.recv().await {
                            for frame in sse.feed(&chunk) {
                                if frame.is_done_marker() {
                                    break 'read;
                                }
                                for event in decoder.on_frame(&frame) {
                                    if !forward_frames(encoder.encode(event), &tx).await {
                                        caller_gone = true;
                                        break 'read;
                                    }
                                }
                            }
                        }
                    }
                    UpstreamBody::Bytes(bytes) => {
                        'frames: for frame in sse.feed(&bytes) {
                            if frame.is_done_marker() {
                                break;
                            }
                            for event in decoder.on_frame(&frame) {
                                if !forward_frames(encoder.encode(event), &tx).await {
                                    caller_gone = true;
                                    break 'frames;
                                }
                            }
                        }
                    }
                }

                if !caller_gone {
                    'flush: for frame in sse.flush() {
                        for event in decoder.on_frame(&frame) {
                            if !forward_frames(encoder.encode(event), &tx).await {
                                caller_gone = true;
                                break 'flush;
                            }
                        }
                    }
                }
                for event in decoder.on_end() {
                    if caller_gone {
                        encoder.absorb(event);
                    } else if !forward_frames(encoder.encode(event), &tx).await {
                        caller_gone = true;
                    }
                }
                // The terminal marker fires exactly once even when the
                // upstream closed without one.
                let terminal = encoder.finish();
                if !caller_gone {
                    forward_frames(terminal, &tx).await;
                }
                drop(tx);

                let usage = encoder.observed_usage().unwrap_or_default();
                accountant.mark_success(&account_for_task.id).await;
                usage_recorder.record(UsageEvent {
                    user_id: caller_for_task.user_id,
                    api_key_id: Some(caller_for_task.api_key_id),
                    provider_account_id: account_for_task.id,
                    provider: account_for_task.provider,
                    model,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    status_code: 200,
                    started_at: started,
                });
            });

            return ProxyReply::stream(rx);
        }

        // Non-stream caller: aggregate the whole upstream stream.
        let mut sse = SseDecoder::new();
        let mut aggregator = ResponseAggregator::new(dialect, &model, canonical.include_reasoning);
        match resp.body {
            UpstreamBody::Stream(mut upstream_rx) => {
                'read: while let Some(chunk) = upstream_rx.recv().await {
                    for frame in sse.feed(&chunk) {
                        if frame.is_done_marker() {
                            break 'read;
                        }
                        for event in decoder.on_frame(&frame) {
                            aggregator.push(event);
                        }
                    }
                }
            }
            UpstreamBody::Bytes(bytes) => {
                for frame in sse.feed(&bytes) {
                    if frame.is_done_marker() {
                        break;
                    }
                    for event in decoder.on_frame(&frame) {
                        aggregator.push(event);
                    }
                }
            }
        }
        for frame in sse.flush() {
            for event in decoder.on_frame(&frame) {
                aggregator.push(event);
            }
        }
        for event in decoder.on_end() {
            aggregator.push(event);
        }

        let usage = aggregator.observed_usage().unwrap_or_default();
        self.accountant.mark_success(&account.id).await;
        self.record_usage(&caller, &account, &model, usage, 200, started);

        match aggregator.finalize_json() {
            Ok(body) => ProxyReply::json(200, body),
            Err(err) => {
                warn!(error = %err, "response serialization failed");
                internal_error(dialect)
            }
        }
    }

    fn record_usage(
        &self,
        caller: &CallerIdentity,
        account: &AccountRow,
        model: &str,
        usage: TokenUsage,
        status_code: u16,
        started: Instant,
    ) {
        self.usage.record(UsageEvent {
            user_id: caller.user_id.clone(),
            api_key_id: Some(caller.api_key_id.clone()),
            provider_account_id: account.id.clone(),
            provider: account.provider.clone(),
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            status_code,
            started_at: started,
        });
    }

    fn rate_limited_reply(&self, dialect: Dialect, wait_ms: u64) -> ProxyReply {
        // Whole-second granularity; the ledger is read a few ms after
        // entries are written and the remainder is noise.
        let wait_ms = wait_ms.div_ceil(1000) * 1000;
        let detail = ErrorDetail::new(
            ErrorKind::RateLimitError,
            format!(
                "All available accounts are rate limited for this model family. Retry in {}.",
                format_wait_time(wait_ms)
            ),
        )
        .with_retry_after_ms(wait_ms);
        error_reply(dialect, 429, detail)
    }
}

async fn forward_frames(frames: Vec<String>, tx: &tokio::sync::mpsc::Sender<Bytes>) -> bool {
    for frame in frames {
        if tx.send(Bytes::from(frame)).await.is_err() {
            return false;
        }
    }
    true
}

fn bad_request(dialect: Dialect, message: &str) -> ProxyReply {
    error_reply(
        dialect,
        400,
        ErrorDetail::new(ErrorKind::InvalidRequestError, message.to_string()),
    )
}

fn internal_error(dialect: Dialect) -> ProxyReply {
    error_reply(
        dialect,
        500,
        ErrorDetail::new(ErrorKind::ApiError, "Internal proxy error."),
    )
}

pub(crate) fn error_reply(dialect: Dialect, status: u16, detail: ErrorDetail) -> ProxyReply {
    let body = match dialect {
        Dialect::Anthropic => {
            let envelope = AnthropicErrorEnvelope::new(detail.r#type, detail.message);
            serde_json::to_vec(&envelope).unwrap_or_default()
        }
        Dialect::Chat | Dialect::Responses => {
            let envelope = ErrorEnvelope { error: detail };
            serde_json::to_vec(&envelope).unwrap_or_default()
        }
    };
    ProxyReply::json(status, Bytes::from(body))
}

/// Canonical events → wire-ready SSE frame strings for one dialect.
enum ResponseEncoder {
    Chat(ChatStreamEncoder),
    Anthropic(AnthropicStreamEncoder),
    Responses(ResponsesStreamEncoder),
}

impl ResponseEncoder {
    fn new(dialect: Dialect, model: &str, include_reasoning: bool) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let created = OffsetDateTime::now_utc().unix_timestamp();
        match dialect {
            Dialect::Chat => Self::Chat(ChatStreamEncoder::new(
                format!("chatcmpl-{suffix}"),
                model,
                created,
            )),
            Dialect::Anthropic => Self::Anthropic(AnthropicStreamEncoder::new(
                format!("msg_{suffix}"),
                model,
                include_reasoning,
            )),
            Dialect::Responses => Self::Responses(ResponsesStreamEncoder::new(
                format!("resp_{suffix}"),
                model,
                created,
            )),
        }
    }

    fn encode(&mut self, event: CanonicalEvent) -> Vec<String> {
        match self {
            Self::Chat(encoder) => encoder.encode(event).iter().map(chat_frame).collect(),
            Self::Anthropic(encoder) => {
                encoder.encode(event).iter().map(anthropic_frame).collect()
            }
            Self::Responses(encoder) => {
                encoder.encode(event).iter().map(responses_frame).collect()
            }
        }
    }

    fn finish(&mut self) -> Vec<String> {
        match self {
            Self::Chat(encoder) => encoder.finish().iter().map(chat_frame).collect(),
            Self::Anthropic(encoder) => {
                encoder.finish().iter().map(anthropic_frame).collect()
            }
            Self::Responses(encoder) => {
                encoder.finish().iter().map(responses_frame).collect()
            }
        }
    }

    /// Updates encoder state (usage, finish reason) without producing
    /// frames; used once the caller is gone.
    fn absorb(&mut self, event: CanonicalEvent) {
        match self {
            Self::Chat(encoder) => {
                encoder.encode(event);
            }
            Self::Anthropic(encoder) => {
                encoder.encode(event);
            }
            Self::Responses(encoder) => {
                encoder.encode(event);
            }
        }
    }

    fn observed_usage(&self) -> Option<TokenUsage> {
        match self {
            Self::Chat(encoder) => encoder.observed_usage(),
            Self::Anthropic(encoder) => encoder.observed_usage(),
            Self::Responses(encoder) => encoder.observed_usage(),
        }
    }
}

fn chat_frame(item: &ChatStreamItem) -> String {
    match item {
        ChatStreamItem::Chunk(chunk) => encode_frame(
            None,
            &serde_json::to_string(chunk).unwrap_or_default(),
        ),
        ChatStreamItem::Done => encode_frame(None, "[DONE]"),
    }
}

fn anthropic_frame(event: &opendum_protocol::anthropic::stream::MessagesStreamEvent) -> String {
    encode_frame(
        Some(event.event_name()),
        &serde_json::to_string(event).unwrap_or_default(),
    )
}

fn responses_frame(event: &opendum_protocol::responses::stream::ResponsesStreamEvent) -> String {
    encode_frame(
        Some(event.event_name()),
        &serde_json::to_string(event).unwrap_or_default(),
    )
}

/// Canonical events → one non-stream dialect body.
enum ResponseAggregator {
    Chat(ChatAggregator),
    Anthropic(AnthropicAggregator),
    Responses(ResponsesStreamEncoder),
}

impl ResponseAggregator {
    fn new(dialect: Dialect, model: &str, include_reasoning: bool) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let created = OffsetDateTime::now_utc().unix_timestamp();
        match dialect {
            Dialect::Chat => Self::Chat(ChatAggregator::new(
                format!("chatcmpl-{suffix}"),
                model,
                created,
            )),
            Dialect::Anthropic => Self::Anthropic(AnthropicAggregator::new(
                format!("msg_{suffix}"),
                model,
                include_reasoning,
            )),
            Dialect::Responses => Self::Responses(ResponsesStreamEncoder::new(
                format!("resp_{suffix}"),
                model,
                created,
            )),
        }
    }

    fn push(&mut self, event: CanonicalEvent) {
        match self {
            Self::Chat(aggregator) => aggregator.push(event),
            Self::Anthropic(aggregator) => aggregator.push(event),
            Self::Responses(encoder) => {
                encoder.encode(event);
            }
        }
    }

    fn observed_usage(&self) -> Option<TokenUsage> {
        match self {
            Self::Chat(aggregator) => aggregator.observed_usage(),
            Self::Anthropic(aggregator) => aggregator.observed_usage(),
            Self::Responses(encoder) => encoder.observed_usage(),
        }
    }

    fn finalize_json(self) -> Result<Bytes, serde_json::Error> {
        let bytes = match self {
            Self::Chat(aggregator) => serde_json::to_vec(&aggregator.finalize())?,
            Self::Anthropic(aggregator) => serde_json::to_vec(&aggregator.finalize())?,
            Self::Responses(encoder) => {
                serde_json::to_vec(&encoder.response_object(encoder.final_status()))?
            }
        };
        Ok(Bytes::from(bytes))
    }
}
