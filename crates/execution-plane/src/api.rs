//! HTTP surface: request intake and status queries.
//!
//! Handlers never touch executor state. They verify the signature envelope,
//! mint a `Received` message, enqueue the parsed request and return the
//! message id; everything after that is observable through the status route.
//! Malformed payloads still produce a message so the caller can see the
//! rejection reason.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use common_types::health::Heartbeats;
use common_types::{
    parse_units, unix_now, Address, CancelRequest, IncomingItem, Message, MessageId, MessageKind,
    MessageStatus, MessageStore, OrderId, OrderRequest, Price, Request, Side, WithdrawRequest,
    Asset,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::auth::{self, AuthError};

#[derive(Clone)]
pub struct ApiContext {
    pub incoming: mpsc::Sender<IncomingItem>,
    pub store: Arc<MessageStore>,
    pub heartbeats: Arc<Heartbeats>,
    pub skew_window_secs: u64,
}

#[derive(Debug)]
struct Unauthorized(AuthError);
impl warp::reject::Reject for Unauthorized {}

#[derive(Debug)]
struct QueueClosed;
impl warp::reject::Reject for QueueClosed {}

#[derive(Deserialize)]
struct OrderBody {
    side: String,
    price: String,
    quantity: String,
}

#[derive(Deserialize)]
struct CancelBody {
    order_id: String,
}

#[derive(Deserialize)]
struct WithdrawalBody {
    asset: String,
    amount: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    message_id: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct MessageView {
    message_id: String,
    kind: MessageKind,
    status: &'static str,
    reason: Option<String>,
    created_at: u64,
    processed_at: Option<u64>,
    order_id: Option<u64>,
    trade_ids: Vec<u64>,
    tx_hash: Option<String>,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        let (status, reason) = match &message.status {
            MessageStatus::Received => ("received", None),
            MessageStatus::Accepted => ("accepted", None),
            MessageStatus::Rejected(reason) => ("rejected", Some(reason.clone())),
            MessageStatus::SettlementPending => ("settlement_pending", None),
            MessageStatus::SettlementConfirmed => ("settlement_confirmed", None),
            MessageStatus::SettlementFailed(reason) => ("settlement_failed", Some(reason.clone())),
        };
        MessageView {
            message_id: message.id.to_string(),
            kind: message.kind,
            status,
            reason,
            created_at: message.created_at,
            processed_at: message.processed_at,
            order_id: message.order_id.map(|id| id.0),
            trade_ids: message.trade_ids.iter().map(|id| id.0).collect(),
            tx_hash: message.tx_hash.clone(),
        }
    }
}

/// All routes, with rejection handling folded in.
pub fn routes(
    ctx: ApiContext,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let submit = warp::post()
        .and(warp::path("orders"))
        .and(warp::path::end())
        .and(auth_headers())
        .and(warp::body::bytes())
        .and(with_ctx(ctx.clone()))
        .and_then(submit_order);

    let cancel = warp::post()
        .and(warp::path!("orders" / "cancel"))
        .and(auth_headers())
        .and(warp::body::bytes())
        .and(with_ctx(ctx.clone()))
        .and_then(cancel_order);

    let withdraw = warp::post()
        .and(warp::path("withdrawals"))
        .and(warp::path::end())
        .and(auth_headers())
        .and(warp::body::bytes())
        .and(with_ctx(ctx.clone()))
        .and_then(request_withdrawal);

    let status = warp::get()
        .and(warp::path("messages"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(with_ctx(ctx.clone()))
        .and_then(message_status);

    let health = warp::get()
        .and(warp::path("health"))
        .and(warp::path::end())
        .and(with_ctx(ctx))
        .map(|ctx: ApiContext| warp::reply::json(&ctx.heartbeats.report()));

    submit
        .or(cancel)
        .or(withdraw)
        .or(status)
        .or(health)
        .recover(handle_rejection)
}

fn with_ctx(ctx: ApiContext) -> impl Filter<Extract = (ApiContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

fn auth_headers() -> impl Filter<Extract = (String, String, String), Error = Rejection> + Copy {
    warp::header::<String>("x-address")
        .and(warp::header::<String>("x-signature"))
        .and(warp::header::<String>("x-timestamp"))
}

fn authenticate(
    ctx: &ApiContext,
    address: &str,
    signature: &str,
    timestamp: &str,
    path: &str,
    body: &[u8],
) -> Result<Address, Rejection> {
    auth::verify_request(
        address,
        signature,
        timestamp,
        unix_now(),
        ctx.skew_window_secs,
        "POST",
        path,
        body,
    )
    .map_err(|error| warp::reject::custom(Unauthorized(error)))
}

/// Record the message, enqueue the request if it parsed, reply with the id.
async fn accept(
    ctx: ApiContext,
    kind: MessageKind,
    user: Address,
    parsed: Result<Request, String>,
) -> Result<warp::reply::Json, Rejection> {
    let message = Message::new(kind, user);
    let message_id = message.id;
    ctx.store.insert(message);
    match parsed {
        Ok(request) => {
            ctx.incoming
                .send((message_id, request))
                .await
                .map_err(|_| warp::reject::custom(QueueClosed))?;
        }
        Err(reason) => {
            ctx.store.advance(message_id, MessageStatus::Rejected(reason));
        }
    }
    Ok(warp::reply::json(&SubmitResponse {
        message_id: message_id.to_string(),
    }))
}

async fn submit_order(
    address: String,
    signature: String,
    timestamp: String,
    body: Bytes,
    ctx: ApiContext,
) -> Result<impl Reply, Rejection> {
    let user = authenticate(&ctx, &address, &signature, &timestamp, "/orders", &body)?;
    accept(ctx, MessageKind::Order, user, parse_order(&body, user)).await
}

async fn cancel_order(
    address: String,
    signature: String,
    timestamp: String,
    body: Bytes,
    ctx: ApiContext,
) -> Result<impl Reply, Rejection> {
    let user = authenticate(&ctx, &address, &signature, &timestamp, "/orders/cancel", &body)?;
    accept(ctx, MessageKind::Cancel, user, parse_cancel(&body, user)).await
}

async fn request_withdrawal(
    address: String,
    signature: String,
    timestamp: String,
    body: Bytes,
    ctx: ApiContext,
) -> Result<impl Reply, Rejection> {
    let user = authenticate(&ctx, &address, &signature, &timestamp, "/withdrawals", &body)?;
    accept(ctx, MessageKind::Withdrawal, user, parse_withdrawal(&body, user)).await
}

fn parse_order(body: &[u8], user: Address) -> Result<Request, String> {
    let dto: OrderBody =
        serde_json::from_slice(body).map_err(|error| format!("malformed body: {error}"))?;
    let side = match dto.side.as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => return Err(format!("unknown side: {other}")),
    };
    let price = parse_units(&dto.price).map_err(|error| format!("bad price: {error}"))?;
    let quantity = parse_units(&dto.quantity).map_err(|error| format!("bad quantity: {error}"))?;
    Ok(Request::Order(OrderRequest {
        user,
        side,
        price: Price(price),
        quantity,
    }))
}

fn parse_cancel(body: &[u8], user: Address) -> Result<Request, String> {
    let dto: CancelBody =
        serde_json::from_slice(body).map_err(|error| format!("malformed body: {error}"))?;
    let order_id = dto
        .order_id
        .parse::<u64>()
        .map_err(|_| format!("bad order id: {}", dto.order_id))?;
    Ok(Request::Cancel(CancelRequest {
        user,
        order_id: OrderId(order_id),
    }))
}

fn parse_withdrawal(body: &[u8], user: Address) -> Result<Request, String> {
    let dto: WithdrawalBody =
        serde_json::from_slice(body).map_err(|error| format!("malformed body: {error}"))?;
    let asset = match dto.asset.as_str() {
        "a" => Asset::A,
        "b" => Asset::B,
        other => return Err(format!("unknown asset: {other}")),
    };
    // Withdrawal amounts arrive already in base units.
    let amount = dto
        .amount
        .parse::<u128>()
        .map_err(|_| format!("bad amount: {}", dto.amount))?;
    Ok(Request::Withdraw(WithdrawRequest { user, asset, amount }))
}

async fn message_status(raw_id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let id = MessageId::parse(&raw_id).map_err(|_| warp::reject::not_found())?;
    match ctx.store.get(id) {
        Some(message) => Ok(warp::reply::json(&MessageView::from(&message))),
        None => Err(warp::reject::not_found()),
    }
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (code, error) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(Unauthorized(auth_error)) = rejection.find() {
        (StatusCode::UNAUTHORIZED, auth_error.to_string())
    } else if rejection.find::<QueueClosed>().is_some() {
        (StatusCode::SERVICE_UNAVAILABLE, "service shutting down".to_string())
    } else if rejection.find::<warp::reject::MissingHeader>().is_some() {
        (StatusCode::BAD_REQUEST, "missing authentication headers".to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody { error }),
        code,
    ))
}
