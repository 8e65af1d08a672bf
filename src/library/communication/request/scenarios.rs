use super::{Correlator, Responder, ResponseOutcome};
use crate::domain::{transform, ComputeRequest, Doubler};
use crate::library::communication::codec::{Codec, WireFormat};
use crate::library::communication::error::Error;
use crate::library::communication::implementation::memory::{
    BrokerConfig, DispatchOrder, MemoryBroker,
};
use crate::library::communication::request::testing::session;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::Instant;

const POLL: Duration = Duration::from_millis(10);

async fn client(broker: &MemoryBroker, id: &str) -> Correlator<ComputeRequest> {
    Correlator::with_id(session(broker).await, WireFormat::Bson, id.into())
        .await
        .unwrap()
}

async fn server(broker: &MemoryBroker) -> Responder<Doubler> {
    Responder::open(session(broker).await, Doubler, WireFormat::Bson)
        .await
        .unwrap()
}

#[tokio::test]
async fn answer_a_single_client() {
    let broker = MemoryBroker::default();
    let server = server(&broker).await;
    let a = client(&broker, "A").await;

    a.send_request(21).await.unwrap();
    assert!(server.process_request_response_cycle(POLL).await.unwrap());

    assert_eq!(a.get_response(POLL).await.unwrap(), ResponseOutcome::Accepted(42));
}

#[tokio::test]
async fn answer_zero_with_zero() {
    let broker = MemoryBroker::default();
    let server = server(&broker).await;
    let a = client(&broker, "A").await;

    a.send_request(0).await.unwrap();
    assert!(server.process_request_response_cycle(POLL).await.unwrap());

    assert_eq!(a.get_response(POLL).await.unwrap(), ResponseOutcome::Accepted(0));
}

#[tokio::test]
async fn hand_misdelivered_responses_to_their_owner() {
    let broker = MemoryBroker::default();
    let server = server(&broker).await;
    let a = client(&broker, "A").await;

    let request = WireFormat::Bson
        .encode(&ComputeRequest {
            id: "B".into(),
            value: 5,
        })
        .unwrap();
    assert!(broker.publish_raw("/", "defaultExchange", "defaultRequestQueue", request));
    assert!(server.process_request_response_cycle(POLL).await.unwrap());

    assert_eq!(
        a.get_response(POLL).await.unwrap(),
        ResponseOutcome::Requeued("B".into())
    );
    assert_eq!(
        a.get_response(POLL).await.unwrap(),
        ResponseOutcome::Requeued("B".into())
    );

    let b = client(&broker, "B").await;
    a.send_request(21).await.unwrap();
    assert!(server.process_request_response_cycle(POLL).await.unwrap());

    let mut results = (None, None);
    for _ in 0..50 {
        if results.0.is_none() {
            results.0 = a.get_response(POLL).await.unwrap().accepted();
        }
        if results.1.is_none() {
            results.1 = b.get_response(POLL).await.unwrap().accepted();
        }
        if results.0.is_some() && results.1.is_some() {
            break;
        }
    }

    assert_eq!(results, (Some(42), Some(10)));
    let statistics = broker.statistics();
    assert_eq!(statistics.acknowledged, 4);
    assert!(statistics.rejected >= 2);
    assert_eq!(statistics.rejected, statistics.requeued);
}

#[tokio::test]
async fn return_nothing_from_an_empty_queue_in_time() {
    let broker = MemoryBroker::default();
    let a = client(&broker, "A").await;
    let timeout = Duration::from_millis(100);

    let started = Instant::now();
    let outcome = a.get_response(timeout).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome, ResponseOutcome::Empty);
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout * 5);
}

#[tokio::test]
async fn publish_nothing_for_corrupted_requests() {
    let broker = MemoryBroker::default();
    let server = server(&broker).await;
    assert!(broker.publish_raw(
        "/",
        "defaultExchange",
        "defaultRequestQueue",
        Vec::new()
    ));

    let result = server.process_request_response_cycle(POLL).await;

    assert!(matches!(result, Err(Error::Deserialization { .. })));
    assert_eq!(broker.statistics().published, 1);
    assert_eq!(broker.queue_depth("/", "defaultResponseQueue"), 0);
}

async fn serve_competing_clients(broker: MemoryBroker) {
    let server = server(&broker).await;
    let mut clients = Vec::new();
    for index in 0..5 {
        let value = if index % 2 == 0 { index * 10 } else { -index * 10 };
        let correlator = client(&broker, &format!("client-{}", index)).await;
        correlator.send_request(value).await.unwrap();
        clients.push((format!("client-{}", index), Some(correlator), value, None));
    }

    for _ in 0..200 {
        server.process_request_response_cycle(POLL).await.unwrap();

        for (id, slot, value, result) in clients.iter_mut() {
            let correlator = match slot {
                Some(correlator) => correlator,
                None => continue,
            };

            if let Some(received) = correlator.get_response(POLL).await.unwrap().accepted() {
                assert_eq!(received, transform(*value), "{}", id);
                *result = Some(received);

                if let Some(finished) = slot.take() {
                    finished.close().await.unwrap();
                }
            }
        }

        if clients.iter().all(|(_, _, _, result)| result.is_some()) {
            break;
        }
    }

    for (id, _, value, result) in &clients {
        assert_eq!(*result, Some(transform(*value)), "{}", id);
    }
    let statistics = broker.statistics();
    assert_eq!(statistics.acknowledged, 10);
    // Closing clients also hand back what they were holding
    assert!(statistics.requeued >= statistics.rejected);
    assert_eq!(broker.queue_depth("/", "defaultResponseQueue"), 0);
    assert_eq!(broker.consumer_count("/", "defaultResponseQueue"), 0);
}

#[tokio::test]
async fn serve_competing_clients_taking_turns() {
    serve_competing_clients(MemoryBroker::default()).await;
}

#[tokio::test]
async fn serve_competing_clients_in_random_order() {
    for seed in 0..3 {
        serve_competing_clients(MemoryBroker::new(BrokerConfig {
            dispatch: DispatchOrder::Shuffled { seed },
            ..Default::default()
        }))
        .await;
    }
}
