//! Command dispatcher
//!
//! Turns a (command, selector) pair into addressed publishes and correlates
//! the answers by the device id found in the response topic.
//!
//! Per invocation: `Idle -> Resolving -> Dispatching -> AwaitingResponses`,
//! ending in `Complete` (everyone answered) or `TimedOut` (silent devices
//! are reported as `Timeout` responses). Nothing is retried. Losing the
//! broker while waiting aborts the invocation with `TransportUnavailable`.

use crate::config::AddressingMode;
use crate::error::{DispatchError, DispatchResult};
use crate::inventory::FleetInventory;
use crate::models::{dedup_preserving_order, Command, CommandKind, DeviceId, DeviceKind, Response, TargetSelector};
use crate::topics;
use crate::transport::{InboundMessage, Transport};
use futures::future::try_join_all;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Deadlines past this horizon are clamped
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, clamped instead of overflowing on huge timeouts
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Resolving,
    Dispatching,
    AwaitingResponses,
    Complete,
    TimedOut,
}

/// Recipients produced by `resolve`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTargets {
    pub devices: Vec<DeviceId>,
    /// Resolved from `all`, so the group address may be used
    pub from_wildcard: bool,
}

/// Proof that a command went out, consumed by `await_responses`
#[derive(Debug)]
pub struct DispatchHandle {
    command: CommandKind,
    device_kind: DeviceKind,
    recipients: Vec<DeviceId>,
}

pub struct Dispatcher<T: Transport> {
    transport: T,
    inventory: FleetInventory,
    addressing: AddressingMode,
    state: DispatchState,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, inventory: FleetInventory, addressing: AddressingMode) -> Self {
        Self {
            transport,
            inventory,
            addressing,
            state: DispatchState::Idle,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Give the connection back so the caller can close it
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Turn a selector into the concrete set of recipients
    pub async fn resolve(&mut self, selector: &TargetSelector, kind: DeviceKind) -> DispatchResult<ResolvedTargets> {
        self.state = DispatchState::Resolving;

        match selector {
            TargetSelector::All => {
                let devices = self.inventory.resolve_all(kind, &mut self.transport).await?;
                Ok(ResolvedTargets {
                    devices,
                    from_wildcard: true,
                })
            }
            TargetSelector::Explicit(ids) => {
                let devices = dedup_preserving_order(ids.clone());
                if devices.is_empty() {
                    return Err(DispatchError::InvalidSelector("no device given".into()));
                }
                Ok(ResolvedTargets {
                    devices,
                    from_wildcard: false,
                })
            }
        }
    }

    /// Subscribe to the answers, then publish the command to every recipient
    pub async fn dispatch(&mut self, command: &Command, targets: ResolvedTargets) -> DispatchResult<DispatchHandle> {
        if targets.devices.is_empty() {
            return Err(DispatchError::InvalidSelector("no recipient to dispatch to".into()));
        }

        self.state = DispatchState::Dispatching;
        let kind = command.kind();
        let device_kind = kind.device_kind();
        let payload = command.encode()?;

        if self.addressing == AddressingMode::Broadcast && targets.from_wildcard {
            self.transport
                .subscribe(&topics::wildcard_resp_topic(device_kind, kind))
                .await?;
            self.transport
                .publish(&topics::group_cmd_topic(device_kind, kind), payload)
                .await?;
            info!("Broadcast {} to all {}", kind, device_kind.label());
        } else {
            for device in &targets.devices {
                self.transport
                    .subscribe(&topics::resp_topic(device_kind, device, kind))
                    .await?;
            }

            let transport = &self.transport;
            let publishes = targets.devices.iter().map(|device| {
                let topic = topics::cmd_topic(device_kind, device, kind);
                let payload = payload.clone();
                async move { transport.publish(&topic, payload).await }
            });
            try_join_all(publishes).await?;
            info!("Sent {} to {} {}", kind, targets.devices.len(), device_kind.label());
        }

        debug!("Waiting for {} responses", targets.devices.len());
        self.state = DispatchState::AwaitingResponses;

        Ok(DispatchHandle {
            command: kind,
            device_kind,
            recipients: targets.devices,
        })
    }

    /// Answers in arrival order, then a `Timeout` for every silent recipient
    pub fn await_responses(&mut self, handle: DispatchHandle, timeout: Duration) -> ResponseStream<'_, T> {
        let expected: HashSet<DeviceId> = handle.recipients.iter().cloned().collect();

        ResponseStream {
            transport: &mut self.transport,
            state: &mut self.state,
            command: handle.command,
            device_kind: handle.device_kind,
            order: handle.recipients,
            expected,
            answered: HashSet::new(),
            deadline: deadline_after(Instant::now(), timeout),
            timeout,
            missing: VecDeque::new(),
            finished: false,
        }
    }

    /// Resolve, dispatch and collect in one go
    pub async fn run(
        &mut self,
        command: &Command,
        selector: &TargetSelector,
        timeout: Duration,
    ) -> DispatchResult<Vec<Response>> {
        let targets = self.resolve(selector, command.kind().device_kind()).await?;
        let handle = self.dispatch(command, targets).await?;
        self.await_responses(handle, timeout).collect().await
    }
}

/// Lazy, finite and non-restartable sequence of responses
pub struct ResponseStream<'a, T: Transport> {
    transport: &'a mut T,
    state: &'a mut DispatchState,
    command: CommandKind,
    device_kind: DeviceKind,
    /// Recipients in request order, used to order timeouts
    order: Vec<DeviceId>,
    expected: HashSet<DeviceId>,
    answered: HashSet<DeviceId>,
    deadline: Instant,
    timeout: Duration,
    missing: VecDeque<DeviceId>,
    finished: bool,
}

impl<'a, T: Transport> ResponseStream<'a, T> {
    pub fn state(&self) -> DispatchState {
        *self.state
    }

    /// Next response; fails if the connection is lost before completion
    pub async fn next(&mut self) -> DispatchResult<Option<Response>> {
        if let Some(device) = self.missing.pop_front() {
            return Ok(Some(Response::timeout(device)));
        }
        if self.finished {
            return Ok(None);
        }

        loop {
            if self.answered.len() == self.expected.len() {
                *self.state = DispatchState::Complete;
                self.finished = true;
                return Ok(None);
            }

            match timeout_at(self.deadline, self.transport.next_message()).await {
                Ok(Some(message)) => {
                    if let Some(response) = self.accept(message) {
                        return Ok(Some(response));
                    }
                }
                Ok(None) => {
                    warn!(
                        "Connection lost with {} of {} responses received",
                        self.answered.len(),
                        self.expected.len()
                    );
                    self.finished = true;
                    return Err(DispatchError::TransportUnavailable(
                        "connection lost while awaiting responses".into(),
                    ));
                }
                Err(_) => {
                    error!("Response message timeout in {} seconds", self.timeout.as_secs());
                    self.expire();
                    return Ok(self.missing.pop_front().map(Response::timeout));
                }
            }
        }
    }

    pub async fn collect(mut self) -> DispatchResult<Vec<Response>> {
        let mut responses = Vec::with_capacity(self.expected.len());
        while let Some(response) = self.next().await? {
            responses.push(response);
        }
        Ok(responses)
    }

    fn accept(&mut self, message: InboundMessage) -> Option<Response> {
        let device = topics::device_from_resp_topic(&message.topic, self.device_kind, self.command)?;

        if !self.expected.contains(device) {
            debug!("Ignoring response from unexpected device {}", device);
            return None;
        }
        if self.answered.contains(device) {
            debug!("{}: duplicate response ignored", message.topic);
            return None;
        }

        let Some(response) = Response::from_payload(device.to_string(), &message.payload) else {
            debug!("{}: exception ignored", message.topic);
            return None;
        };

        debug!("{}: responded {:?}", message.topic, response.status);
        self.answered.insert(response.device.clone());
        Some(response)
    }

    fn expire(&mut self) {
        *self.state = DispatchState::TimedOut;
        self.finished = true;
        self.missing = self
            .order
            .iter()
            .filter(|device| !self.answered.contains(*device))
            .cloned()
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::FirmwareImage;
    use crate::models::{BoardType, ResponseStatus};
    use crate::transport::mock::MockTransport;
    use opentb_devkit::{FirmwareFixtures, MockMqttClient, TestbedMessageBuilder as Msg};

    const SHORT: Duration = Duration::from_millis(150);

    fn dispatcher(client: &MockMqttClient, addressing: AddressingMode) -> Dispatcher<MockTransport> {
        let inventory = FleetInventory::new(
            vec!["otbox01".into(), "otbox02".into()],
            vec!["00-12-4b-00-14-b5-b5-45".into(), "00-12-4b-00-14-b5-b5-e4".into()],
            19,
            76,
            SHORT,
        );
        Dispatcher::new(MockTransport::new(client), inventory, addressing)
    }

    fn explicit(ids: &[&str]) -> TargetSelector {
        TargetSelector::Explicit(ids.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn test_resolve_explicit_is_exact_and_deduplicated() {
        let client = MockMqttClient::new();
        let mut dispatcher = dispatcher(&client, AddressingMode::FanOut);

        let targets = dispatcher
            .resolve(&explicit(&["otbox10", "otbox02", "otbox10"]), DeviceKind::Box)
            .await
            .unwrap();

        assert_eq!(targets.devices, vec!["otbox10", "otbox02"]);
        assert!(!targets.from_wildcard);
        assert_eq!(dispatcher.state(), DispatchState::Resolving);
    }

    #[tokio::test]
    async fn test_resolve_empty_explicit_fails() {
        let client = MockMqttClient::new();
        let mut dispatcher = dispatcher(&client, AddressingMode::FanOut);

        let err = dispatcher.resolve(&explicit(&[]), DeviceKind::Box).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSelector(_)));
    }

    #[tokio::test]
    async fn test_echo_two_boxes_complete() {
        let client = MockMqttClient::new();
        let mut dispatcher = dispatcher(&client, AddressingMode::FanOut);

        let targets = dispatcher
            .resolve(&explicit(&["otbox02", "otbox10"]), DeviceKind::Box)
            .await
            .unwrap();
        let handle = dispatcher.dispatch(&Command::Echo, targets).await.unwrap();
        assert_eq!(dispatcher.state(), DispatchState::AwaitingResponses);

        assert_eq!(client.find_messages_by_topic(&Msg::box_cmd_topic("otbox02", "echo")).len(), 1);
        assert_eq!(client.find_messages_by_topic(&Msg::box_cmd_topic("otbox10", "echo")).len(), 1);
        assert_eq!(
            client.get_subscriptions(),
            vec![Msg::box_resp_topic("otbox02", "echo"), Msg::box_resp_topic("otbox10", "echo")]
        );

        // Arrival order differs from request order
        client
            .simulate_json(Msg::box_resp_topic("otbox10", "echo"), &Msg::echo_ok("Echo Test String"))
            .await
            .unwrap();
        client
            .simulate_json(Msg::box_resp_topic("otbox02", "echo"), &Msg::echo_ok("Echo Test String"))
            .await
            .unwrap();

        let mut stream = dispatcher.await_responses(handle, SHORT);
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.device, "otbox10");
        assert_eq!(second.device, "otbox02");
        assert!(stream.next().await.unwrap().is_none());
        assert_eq!(stream.state(), DispatchState::Complete);
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_silent_recipient_is_reported_as_timeout() {
        let client = MockMqttClient::new();
        let mut dispatcher = dispatcher(&client, AddressingMode::FanOut);

        let targets = dispatcher
            .resolve(&explicit(&["otbox02", "otbox10"]), DeviceKind::Box)
            .await
            .unwrap();
        let handle = dispatcher.dispatch(&Command::Echo, targets).await.unwrap();

        client
            .simulate_json(Msg::box_resp_topic("otbox10", "echo"), &Msg::echo_ok("Echo Test String"))
            .await
            .unwrap();

        let mut stream = dispatcher.await_responses(handle, SHORT);
        let answered = stream.next().await.unwrap().unwrap();
        assert_eq!(answered.status, ResponseStatus::Success);

        let silent = stream.next().await.unwrap().unwrap();
        assert_eq!(silent.device, "otbox02");
        assert_eq!(silent.status, ResponseStatus::Timeout);
        assert_eq!(stream.state(), DispatchState::TimedOut);
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_noise_is_not_counted() {
        let client = MockMqttClient::new();
        let mut dispatcher = dispatcher(&client, AddressingMode::FanOut);

        let targets = dispatcher
            .resolve(&explicit(&["00-12-4b-00-14-b5-b5-45"]), DeviceKind::Mote)
            .await
            .unwrap();
        let fixtures = FirmwareFixtures::new().unwrap();
        let path = fixtures.bootloadable_ihex("main.ihex").unwrap();
        let command = Command::Program {
            board: BoardType::OpenmoteB,
            image: FirmwareImage::load(Some(&path), BoardType::OpenmoteB).unwrap(),
        };
        let handle = dispatcher.dispatch(&command, targets).await.unwrap();

        let mote = "00-12-4b-00-14-b5-b5-45";
        // Exception notice, unknown mote, other command, then the real answer twice
        client.simulate_json(Msg::mote_resp_topic(mote, "program"), &Msg::exception("flashing")).await.unwrap();
        client.simulate_json(Msg::mote_resp_topic("ff-ff", "program"), &Msg::result(true)).await.unwrap();
        client.simulate_json(Msg::box_resp_topic("otbox02", "echo"), &Msg::echo_ok("x")).await.unwrap();
        client.simulate_json(Msg::mote_resp_topic(mote, "program"), &Msg::result(false)).await.unwrap();
        client.simulate_json(Msg::mote_resp_topic(mote, "program"), &Msg::result(true)).await.unwrap();

        let responses = dispatcher.await_responses(handle, SHORT).collect().await.unwrap();

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].device, mote);
        assert_eq!(responses[0].status, ResponseStatus::Failure);
        assert_eq!(dispatcher.state(), DispatchState::Complete);
    }

    #[tokio::test]
    async fn test_program_all_fans_out_same_image() {
        let client = MockMqttClient::new();
        let mut dispatcher = dispatcher(&client, AddressingMode::FanOut);

        let fixtures = FirmwareFixtures::new().unwrap();
        let path = fixtures.bootloadable_ihex("main.ihex").unwrap();
        let command = Command::Program {
            board: BoardType::OpenmoteB,
            image: FirmwareImage::load(Some(&path), BoardType::OpenmoteB).unwrap(),
        };

        client
            .simulate_json(Msg::mote_resp_topic("00-12-4b-00-14-b5-b5-e4", "program"), &Msg::result(true))
            .await
            .unwrap();

        let responses = dispatcher.run(&command, &TargetSelector::All, SHORT).await.unwrap();

        let published = client.get_published_messages();
        assert_eq!(published.len(), 2);
        let bodies: Vec<serde_json::Value> = published
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect();
        assert_eq!(bodies[0], bodies[1]);
        assert_eq!(bodies[0]["description"], "main.ihex");

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].status, ResponseStatus::Success);
        assert_eq!(responses[1].device, "00-12-4b-00-14-b5-b5-45");
        assert_eq!(responses[1].status, ResponseStatus::Timeout);
    }

    #[tokio::test]
    async fn test_broadcast_uses_group_address() {
        let client = MockMqttClient::new();
        let mut dispatcher = dispatcher(&client, AddressingMode::Broadcast);

        client
            .simulate_json(Msg::box_resp_topic("otbox01", "echo"), &Msg::echo_ok("Echo Test String"))
            .await
            .unwrap();
        client
            .simulate_json(Msg::box_resp_topic("otbox02", "echo"), &Msg::echo_ok("Echo Test String"))
            .await
            .unwrap();

        let responses = dispatcher.run(&Command::Echo, &TargetSelector::All, SHORT).await.unwrap();

        let published = client.get_published_messages();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, Msg::box_cmd_topic("all", "echo"));
        assert_eq!(client.get_subscriptions(), vec![Msg::box_resp_topic("+", "echo")]);
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(Response::is_success));
    }

    #[tokio::test]
    async fn test_repeated_discover_is_independent() {
        let client = MockMqttClient::new();
        let selector = explicit(&["otbox02"]);

        let mut first = dispatcher(&client, AddressingMode::FanOut);
        client
            .simulate_json(Msg::box_resp_topic("otbox02", "discovermotes"), &Msg::discover_ok(&[]))
            .await
            .unwrap();
        let responses = first.run(&Command::Discover, &selector, SHORT).await.unwrap();
        assert_eq!(responses[0].status, ResponseStatus::Success);

        // New invocation on a fresh connection: nothing carried over
        let mut second = dispatcher(&client, AddressingMode::FanOut);
        let responses = second.run(&Command::Discover, &selector, SHORT).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, ResponseStatus::Timeout);
    }

    #[tokio::test]
    async fn test_lost_connection_is_fatal() {
        let client = MockMqttClient::new();
        let mut dispatcher = dispatcher(&client, AddressingMode::FanOut);

        let targets = dispatcher
            .resolve(&explicit(&["otbox02", "otbox10"]), DeviceKind::Box)
            .await
            .unwrap();
        let handle = dispatcher.dispatch(&Command::Echo, targets).await.unwrap();
        client
            .simulate_json(Msg::box_resp_topic("otbox10", "echo"), &Msg::echo_ok("Echo Test String"))
            .await
            .unwrap();
        client.disconnect().await.unwrap();

        let mut stream = dispatcher.await_responses(handle, Duration::from_secs(30));
        assert_eq!(stream.next().await.unwrap().unwrap().device, "otbox10");
        let err = stream.next().await.unwrap_err();
        assert!(matches!(err, DispatchError::TransportUnavailable(_)));
        assert!(!err.is_validation());
        assert_eq!(stream.state(), DispatchState::AwaitingResponses);
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_overflow() {
        let client = MockMqttClient::new();
        let mut dispatcher = dispatcher(&client, AddressingMode::FanOut);

        client
            .simulate_json(Msg::box_resp_topic("otbox02", "echo"), &Msg::echo_ok("Echo Test String"))
            .await
            .unwrap();

        let responses = dispatcher
            .run(&Command::Echo, &explicit(&["otbox02"]), Duration::from_secs(u64::MAX))
            .await
            .unwrap();

        assert_eq!(responses.len(), 1);
        assert!(responses[0].is_success());
        assert_eq!(dispatcher.state(), DispatchState::Complete);
    }

    #[test]
    fn test_deadline_is_clamped() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, SHORT), now + SHORT);
        assert!(deadline_after(now, Duration::from_secs(u64::MAX)) > now + Duration::from_secs(86400 * 365));
    }
}
