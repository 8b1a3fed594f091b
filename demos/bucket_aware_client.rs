use std::time::Duration;

use reqbucket::prelude::{
    Backoff, CachePolicy, Endpoint, EndpointIdentity, Error, GlobalRateLimitPolicy, HttpClient,
    RetryPolicy,
};
use reqbucket::{ErrorBody, RateLimitReason};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Gateway {
    url: String,
}

#[derive(Debug, Deserialize)]
struct Channel {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: u32,
    message: String,
}

fn get_channel(channel_id: &str) -> Endpoint {
    Endpoint::get(format!("https://discord.com/api/v10/channels/{channel_id}"))
        .identity(EndpointIdentity::api("getChannel"))
        .path_params([channel_id])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let token = std::env::var("DISCORD_TOKEN").unwrap_or_else(|_| "missing-token".to_owned());
    let channel_id = std::env::var("DISCORD_CHANNEL").unwrap_or_else(|_| "0".to_owned());

    let client = HttpClient::builder()
        .client_name("reqbucket-demo")
        .try_authorization(&format!("Bot {token}"))?
        .request_timeout(Duration::from_secs(5))
        .total_timeout(Duration::from_secs(30))
        .global_rate_limit_policy(GlobalRateLimitPolicy::standard().requests_per_second(50))
        .retry_policy(
            RetryPolicy::standard().max_retries(3).backoff(Backoff::from_retry_header(
                Some(Duration::from_secs(10)),
                false,
                Some(Backoff::exponential(
                    Duration::ZERO,
                    Duration::from_millis(250),
                    2.0,
                    4,
                )),
            )),
        )
        .cache_policy(CachePolicy::standard())
        .try_build()?;

    let gateway: Gateway = client
        .request(Endpoint::get("https://discord.com/api/v10/gateway").requires_auth_header(false))
        .send_json()
        .await?;
    println!("gateway url={}", gateway.url);

    for round in 1..=2 {
        let response = client.request(get_channel(&channel_id)).send_typed::<Channel>().await;
        match response {
            Ok(typed) if typed.response().is_success() => {
                let channel = typed.decode()?;
                println!("round={round} channel id={} name={:?}", channel.id, channel.name);
            }
            Ok(typed) => match typed.decode_error::<ApiError>() {
                Some(ErrorBody::Provider { status, error }) => {
                    println!(
                        "round={round} provider error status={status} code={} message={}",
                        error.code, error.message
                    );
                }
                Some(other) => println!("round={round} status={}", other.status()),
                None => {}
            },
            Err(Error::RateLimited { reason, .. }) if reason == RateLimitReason::GlobalLimit => {
                println!("round={round} global ceiling reached, try again next second");
            }
            Err(error) => return Err(error.into()),
        }
    }

    if let Some(bucket) = client
        .rate_limiter()
        .bucket_for(&EndpointIdentity::api("getChannel"))
    {
        println!(
            "bucket={} remaining={}/{}",
            bucket.token(),
            bucket.remaining(),
            bucket.limit()
        );
    }

    let metrics = client.metrics_snapshot();
    println!(
        "requests={} cache_hits={} retries={} gate_waits={}",
        metrics.requests_started, metrics.cache_hits, metrics.retries, metrics.gate_waits
    );
    Ok(())
}
