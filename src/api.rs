use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::Filter;

use crate::node::Node;
use crate::types::TransactionRequest;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Failed to bind HTTP listener: {0}")]
    Bind(#[from] warp::Error),
}

#[derive(Debug, Deserialize)]
pub struct AmountQuery {
    pub blockchain_address: String,
}

fn with_node(node: Arc<Node>) -> impl Filter<Extract = (Arc<Node>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&node))
}

fn json_reply(body: serde_json::Value, status: StatusCode) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(&body), status)
}

/// `{"message": "success"}` with `ok`, or `{"message": "fail"}` with 400.
fn status_reply(success: bool, ok: StatusCode) -> warp::reply::WithStatus<warp::reply::Json> {
    if success {
        json_reply(serde_json::json!({ "message": "success" }), ok)
    } else {
        json_reply(serde_json::json!({ "message": "fail" }), StatusCode::BAD_REQUEST)
    }
}

async fn get_chain(node: Arc<Node>) -> Result<impl warp::Reply, Infallible> {
    let chain = node.chain().await;
    Ok(warp::reply::json(&serde_json::json!({ "chain": chain })))
}

async fn get_transactions(node: Arc<Node>) -> Result<impl warp::Reply, Infallible> {
    let transactions = node.transaction_pool().await;
    Ok(warp::reply::json(&serde_json::json!({
        "length": transactions.len(),
        "transactions": transactions,
    })))
}

async fn post_transaction(body: Bytes, node: Arc<Node>) -> Result<impl warp::Reply, Infallible> {
    let result = match TransactionRequest::from_json(&body) {
        Ok(request) => node.create_transaction(&request).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = &result {
        log::warn!("POST /transactions failed: {}", e);
    }
    Ok(status_reply(result.is_ok(), StatusCode::CREATED))
}

async fn put_transaction(body: Bytes, node: Arc<Node>) -> Result<impl warp::Reply, Infallible> {
    let result = match TransactionRequest::from_json(&body) {
        Ok(request) => node.relay_transaction(&request).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = &result {
        log::warn!("PUT /transactions failed: {}", e);
    }
    Ok(status_reply(result.is_ok(), StatusCode::OK))
}

async fn delete_transactions(node: Arc<Node>) -> Result<impl warp::Reply, Infallible> {
    node.clear_pool().await;
    Ok(status_reply(true, StatusCode::OK))
}

async fn mine(node: Arc<Node>) -> Result<impl warp::Reply, Infallible> {
    let result = node.mine().await;
    if let Err(e) = &result {
        log::error!("Mining failed: {}", e);
    }
    Ok(status_reply(result.is_ok(), StatusCode::OK))
}

async fn start_mining(node: Arc<Node>) -> Result<impl warp::Reply, Infallible> {
    if !node.start_mining() {
        log::debug!("Mining loop already running");
    }
    Ok(status_reply(true, StatusCode::OK))
}

async fn get_amount(query: AmountQuery, node: Arc<Node>) -> Result<impl warp::Reply, Infallible> {
    let amount = node.calculate_total_amount(&query.blockchain_address).await;
    Ok(warp::reply::json(&serde_json::json!({ "amount": amount })))
}

async fn consensus(node: Arc<Node>) -> Result<impl warp::Reply, Infallible> {
    let replaced = node.resolve_conflicts().await;
    let message = if replaced { "success" } else { "fail" };
    Ok(json_reply(serde_json::json!({ "message": message }), StatusCode::OK))
}

pub fn routes(
    node: Arc<Node>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let chain = warp::path::end()
        .and(warp::get())
        .and(with_node(node.clone()))
        .and_then(get_chain);

    let list_transactions = warp::path!("transactions")
        .and(warp::get())
        .and(with_node(node.clone()))
        .and_then(get_transactions);
    let create_transaction = warp::path!("transactions")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_node(node.clone()))
        .and_then(post_transaction);
    let relay_transaction = warp::path!("transactions")
        .and(warp::put())
        .and(warp::body::bytes())
        .and(with_node(node.clone()))
        .and_then(put_transaction);
    let clear_transactions = warp::path!("transactions")
        .and(warp::delete())
        .and(with_node(node.clone()))
        .and_then(delete_transactions);

    let mine_once = warp::path!("mine")
        .and(warp::get())
        .and(with_node(node.clone()))
        .and_then(mine);
    let mine_start = warp::path!("mine" / "start")
        .and(warp::get())
        .and(with_node(node.clone()))
        .and_then(start_mining);

    let amount = warp::path!("amount")
        .and(warp::get())
        .and(warp::query::<AmountQuery>())
        .and(with_node(node.clone()))
        .and_then(get_amount);

    let resolve = warp::path!("consensus")
        .and(warp::put())
        .and(with_node(node))
        .and_then(consensus);

    chain
        .or(list_transactions)
        .or(create_transaction)
        .or(relay_transaction)
        .or(clear_transactions)
        .or(mine_once)
        .or(mine_start)
        .or(amount)
        .or(resolve)
        .with(warp::log("ledger_node::api"))
}

/// Bind the API to `address`. The returned future serves until the node's
/// shutdown token is cancelled.
pub fn bind(
    address: SocketAddr,
    node: Arc<Node>,
) -> Result<(SocketAddr, impl Future<Output = ()>), ApiError> {
    let token = node.shutdown_token();
    let (bound, server) = warp::serve(routes(node))
        .try_bind_with_graceful_shutdown(address, async move { token.cancelled().await })?;
    Ok((bound, server))
}

pub async fn run_api(address: SocketAddr, node: Arc<Node>) -> Result<(), ApiError> {
    let (bound, server) = bind(address, node)?;
    log::info!("Listening on http://{}", bound);
    server.await;
    log::info!("HTTP server stopped");
    Ok(())
}
