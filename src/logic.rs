use embedded_time::duration::Milliseconds;
use heapless::{Deque, String, Vec};

use crate::{
    config::{
        Config, Endpoint, INBOX_DEPTH, INCOMING_QOS2, MAX_SUBSCRIPTIONS, MAX_TOPIC_LEN, TASK_DEPTH,
    },
    heap::Handle,
    incoming::Incoming,
    keep_alive::KeepAlive,
    layer::{Cx, Data, Event, Layer, LayerResult, LayerState, Wakeup},
    packet::{
        Message, PacketId, QoS,
        connect::{ConnAck, Connect, ConnectReturnCode},
        publish::Publish,
        subscribe::{SubAck, SubAckCode, Subscribe},
        unsubscribe::Unsubscribe,
    },
    packet_id_pool::{Awaiting, PacketIdPool},
    topic,
};

/// Called with the topic and payload of every matching inbound publish.
pub type Handler = fn(&str, &[u8]);

#[derive(Clone, Debug)]
pub enum Task {
    Publish(Publish),
    Subscribe {
        filter: String<MAX_TOPIC_LEN>,
        qos: QoS,
        handler: Handler,
    },
    Unsubscribe {
        filter: String<MAX_TOPIC_LEN>,
    },
}

impl Task {
    pub fn subscribe(filter: &str, qos: QoS, handler: Handler) -> Result<Self, crate::Error> {
        topic::validate_filter(filter)?;

        Ok(Self::Subscribe {
            filter: String::try_from(filter).map_err(|_| crate::Error::BufferTooSmall)?,
            qos,
            handler,
        })
    }

    pub fn unsubscribe(filter: &str) -> Result<Self, crate::Error> {
        topic::validate_filter(filter)?;

        Ok(Self::Unsubscribe {
            filter: String::try_from(filter).map_err(|_| crate::Error::BufferTooSmall)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Publishing,
    Subscribing,
    Unsubscribing,
    Error,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Publishing | Self::Subscribing | Self::Unsubscribing
        )
    }
}

struct Subscription {
    filter: String<MAX_TOPIC_LEN>,
    handler: Handler,
}

struct Delivery {
    publish: Publish,
    handlers: Vec<Handler, MAX_SUBSCRIPTIONS>,
}

struct InFlight {
    id: PacketId,
    message: Message,
    retries: u8,
    timer: Option<Handle>,
}

#[derive(Clone, Copy)]
struct Timeouts {
    connack_ms: u32,
    ack_ms: u32,
    max_retries: u8,
}

pub struct LogicLayer {
    state: SessionState,
    connect: Connect,
    timeouts: Timeouts,
    keep_alive: KeepAlive,
    tasks: Deque<Task, TASK_DEPTH>,
    in_flight: Option<InFlight>,
    ids: PacketIdPool<1>,
    subscriptions: Vec<Subscription, MAX_SUBSCRIPTIONS>,
    incoming: Incoming<INCOMING_QOS2>,
    inbox: Deque<Delivery, INBOX_DEPTH>,
    connack_timer: Option<Handle>,
    keep_alive_timer: Option<Handle>,
    deliver_timer: Option<Handle>,
}

impl LogicLayer {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            connect: Connect::default(),
            timeouts: Timeouts {
                connack_ms: 0,
                ack_ms: 0,
                max_retries: 0,
            },
            keep_alive: KeepAlive::new(0, Milliseconds(0)),
            tasks: Deque::new(),
            in_flight: None,
            ids: PacketIdPool::new(),
            subscriptions: Vec::new(),
            incoming: Incoming::new(),
            inbox: Deque::new(),
            connack_timer: None,
            keep_alive_timer: None,
            deliver_timer: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn queued(&self) -> usize {
        self.tasks.len()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(|s| s.filter.as_str())
    }

    fn send(&mut self, cx: &mut Cx<'_>, message: Message) -> Result<(), crate::Error> {
        trace!("-> {:?}", message.packet_type());
        cx.forward_down(Data::Message(message))?;
        self.keep_alive.on_send(cx.now()?);

        Ok(())
    }

    fn fail(&mut self, err: crate::Error) -> LayerResult {
        self.state = SessionState::Error;
        Err(err)
    }

    fn enqueue(&mut self, cx: &mut Cx<'_>, task: Task) -> LayerResult {
        if self.tasks.is_full() {
            warn!("task queue full");
            return Err(crate::Error::QueueFull);
        }

        if let Task::Subscribe {
            filter, handler, ..
        } = &task
        {
            self.register(filter, *handler)?;
        }

        let _ = self.tasks.push_back(task);
        self.drain(cx)?;

        Ok(LayerState::Ok)
    }

    fn register(&mut self, filter: &str, handler: Handler) -> Result<(), crate::Error> {
        if let Some(existing) = self.subscriptions.iter_mut().find(|s| s.filter == filter) {
            existing.handler = handler;
            return Ok(());
        }

        let filter = String::try_from(filter).map_err(|_| crate::Error::BufferTooSmall)?;
        self.subscriptions
            .push(Subscription { filter, handler })
            .map_err(|_| crate::Error::SubscriptionTableFull)
    }

    fn unregister(&mut self, filter: &str) {
        self.subscriptions.retain(|s| s.filter != filter);
    }

    /// Starts queued tasks until one has to wait for an acknowledgement.
    fn drain(&mut self, cx: &mut Cx<'_>) -> Result<(), crate::Error> {
        while self.state == SessionState::Connected && self.in_flight.is_none() {
            let Some(task) = self.tasks.pop_front() else {
                break;
            };

            self.start(cx, task)?;
        }

        Ok(())
    }

    fn start(&mut self, cx: &mut Cx<'_>, task: Task) -> Result<(), crate::Error> {
        let (message, state) = match task {
            Task::Publish(publish) if publish.flags.qos == QoS::AtMostOnce => {
                self.send(cx, Message::Publish(publish))?;
                cx.notify(Event::Published { packet_id: None });
                return Ok(());
            }
            Task::Publish(mut publish) => {
                let awaiting = match publish.flags.qos {
                    QoS::AtLeastOnce => Awaiting::PubAck,
                    _ => Awaiting::PubRec,
                };
                publish.packet_id = Some(self.ids.allocate(awaiting)?);
                (Message::Publish(publish), SessionState::Publishing)
            }
            Task::Subscribe { filter, qos, .. } => {
                let id = self.ids.allocate(Awaiting::SubAck)?;
                let subscribe = Subscribe::single(id, &filter, qos)?;
                (Message::Subscribe(subscribe), SessionState::Subscribing)
            }
            Task::Unsubscribe { filter } => {
                let id = self.ids.allocate(Awaiting::UnsubAck)?;
                let unsubscribe = Unsubscribe::single(id, &filter)?;
                (Message::Unsubscribe(unsubscribe), SessionState::Unsubscribing)
            }
        };

        let id = packet_id(&message).ok_or(crate::Error::MalformedPacket)?;
        self.send(cx, message.clone())?;

        let timer = cx.schedule(self.timeouts.ack_ms, Wakeup::AckTimeout(id.get()))?;
        self.in_flight = Some(InFlight {
            id,
            message,
            retries: 0,
            timer: Some(timer),
        });
        self.state = state;

        Ok(())
    }

    fn complete(&mut self, cx: &mut Cx<'_>, event: Event) -> Result<(), crate::Error> {
        if let Some(in_flight) = self.in_flight.take() {
            if let Some(timer) = in_flight.timer {
                cx.cancel(timer);
            }
        }

        self.state = SessionState::Connected;
        cx.notify(event);
        self.drain(cx)
    }

    fn in_flight_id(&self) -> Option<PacketId> {
        self.in_flight.as_ref().map(|f| f.id)
    }

    fn on_connack(&mut self, cx: &mut Cx<'_>, connack: ConnAck) -> LayerResult {
        if self.state != SessionState::Connecting {
            warn!("CONNACK while {:?}", self.state);
            return self.fail(crate::Error::ProtocolViolation);
        }

        if let Some(timer) = self.connack_timer.take() {
            cx.cancel(timer);
        }

        if connack.return_code != ConnectReturnCode::Accepted {
            error!("connection refused: {:?}", connack.return_code);
            return self.fail(crate::Error::ConnectionRefused(connack.return_code));
        }

        info!("connected, session present: {}", connack.session_present);
        self.state = SessionState::Connected;
        cx.notify(Event::Connected {
            session_present: connack.session_present,
        });

        if let Some(tick) = self.keep_alive.tick() {
            self.keep_alive_timer = Some(cx.schedule(tick, Wakeup::KeepAlive)?);
        }

        self.drain(cx)?;
        Ok(LayerState::Ok)
    }

    fn on_publish(&mut self, cx: &mut Cx<'_>, publish: Publish) -> LayerResult {
        if !self.state.is_connected() {
            warn!("PUBLISH while {:?}", self.state);
            return self.fail(crate::Error::ProtocolViolation);
        }

        let fresh = match (publish.flags.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => true,
            (QoS::AtLeastOnce, Some(id)) => {
                self.send(cx, Message::PubAck(id))?;
                true
            }
            (QoS::ExactlyOnce, Some(id)) => {
                let fresh = self.incoming.receive(id)?;
                self.send(cx, Message::PubRec(id))?;
                fresh
            }
            (_, None) => return self.fail(crate::Error::MalformedPacket),
        };

        if fresh {
            self.enqueue_delivery(cx, publish)?;
        } else {
            debug!("duplicate QoS 2 publish, not delivered again");
        }

        Ok(LayerState::Ok)
    }

    fn enqueue_delivery(&mut self, cx: &mut Cx<'_>, publish: Publish) -> Result<(), crate::Error> {
        let handlers: Vec<Handler, MAX_SUBSCRIPTIONS> = self
            .subscriptions
            .iter()
            .filter(|s| topic::matches(&publish.topic, &s.filter))
            .map(|s| s.handler)
            .collect();

        if handlers.is_empty() {
            debug!("no handler for {}", publish.topic.as_str());
            return Ok(());
        }

        if self.inbox.push_back(Delivery { publish, handlers }).is_err() {
            warn!("inbox full, dropping inbound message");
            return Ok(());
        }

        if self.deliver_timer.is_none() {
            self.deliver_timer = Some(cx.defer(Wakeup::Deliver)?);
        }

        Ok(())
    }

    fn deliver(&mut self) {
        self.deliver_timer = None;

        while let Some(delivery) = self.inbox.pop_front() {
            for &handler in delivery.handlers.iter() {
                handler(delivery.publish.topic.as_str(), &delivery.publish.payload);
            }
        }
    }

    fn on_puback(&mut self, cx: &mut Cx<'_>, id: PacketId) -> LayerResult {
        if self.in_flight_id() != Some(id) || self.ids.release(id, Awaiting::PubAck).is_err() {
            warn!("stray PUBACK {}, id awaits {:?}", id.get(), self.ids.awaiting(id));
            return Ok(LayerState::Ok);
        }

        self.complete(cx, Event::Published { packet_id: Some(id) })?;
        Ok(LayerState::Ok)
    }

    fn on_pubrec(&mut self, cx: &mut Cx<'_>, id: PacketId) -> LayerResult {
        if self.in_flight_id() != Some(id) || self.ids.on_pubrec(id).is_err() {
            warn!("stray PUBREC {}, id awaits {:?}", id.get(), self.ids.awaiting(id));
            return Ok(LayerState::Ok);
        }

        self.send(cx, Message::PubRel(id))?;

        let timer = cx.schedule(self.timeouts.ack_ms, Wakeup::AckTimeout(id.get()))?;
        if let Some(in_flight) = self.in_flight.as_mut() {
            if let Some(old) = in_flight.timer.replace(timer) {
                cx.cancel(old);
            }
            in_flight.message = Message::PubRel(id);
            in_flight.retries = 0;
        }

        Ok(LayerState::Ok)
    }

    fn on_pubcomp(&mut self, cx: &mut Cx<'_>, id: PacketId) -> LayerResult {
        if self.in_flight_id() != Some(id) || self.ids.release(id, Awaiting::PubComp).is_err() {
            warn!("stray PUBCOMP {}, id awaits {:?}", id.get(), self.ids.awaiting(id));
            return Ok(LayerState::Ok);
        }

        self.complete(cx, Event::Published { packet_id: Some(id) })?;
        Ok(LayerState::Ok)
    }

    fn on_suback(&mut self, cx: &mut Cx<'_>, suback: SubAck) -> LayerResult {
        let id = suback.packet_id;
        if self.in_flight_id() != Some(id) || self.ids.release(id, Awaiting::SubAck).is_err() {
            warn!("stray SUBACK {}, id awaits {:?}", id.get(), self.ids.awaiting(id));
            return Ok(LayerState::Ok);
        }

        let event = match suback.return_codes.first() {
            Some(SubAckCode::Granted(granted)) => Event::Subscribed {
                packet_id: id,
                granted: *granted,
            },
            _ => {
                if let Some(filter) = self.in_flight_filter() {
                    warn!("subscription to {} refused", filter.as_str());
                    self.unregister(&filter);
                }
                Event::SubscribeFailed { packet_id: id }
            }
        };

        self.complete(cx, event)?;
        Ok(LayerState::Ok)
    }

    fn on_unsuback(&mut self, cx: &mut Cx<'_>, id: PacketId) -> LayerResult {
        if self.in_flight_id() != Some(id) || self.ids.release(id, Awaiting::UnsubAck).is_err() {
            warn!("stray UNSUBACK {}, id awaits {:?}", id.get(), self.ids.awaiting(id));
            return Ok(LayerState::Ok);
        }

        if let Some(filter) = self.in_flight_filter() {
            self.unregister(&filter);
        }

        self.complete(cx, Event::Unsubscribed { packet_id: id })?;
        Ok(LayerState::Ok)
    }

    fn in_flight_filter(&self) -> Option<String<MAX_TOPIC_LEN>> {
        match self.in_flight.as_ref().map(|f| &f.message) {
            Some(Message::Subscribe(subscribe)) => {
                subscribe.topics.first().map(|s| s.topic_filter.clone())
            }
            Some(Message::Unsubscribe(unsubscribe)) => unsubscribe.topics.first().cloned(),
            _ => None,
        }
    }

    fn on_ack_timeout(&mut self, cx: &mut Cx<'_>, id: u16) -> LayerResult {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return Ok(LayerState::Ok);
        };

        if in_flight.id.get() != id {
            return Ok(LayerState::Ok);
        }

        in_flight.timer = None;

        if in_flight.retries < self.timeouts.max_retries {
            in_flight.retries += 1;
            warn!("no ack for {}, retry {}", id, in_flight.retries);

            let mut message = in_flight.message.clone();
            if let Message::Publish(publish) = &mut message {
                publish.flags.dup = true;
            }

            self.send(cx, message)?;
            let timer = cx.schedule(self.timeouts.ack_ms, Wakeup::AckTimeout(id))?;
            if let Some(in_flight) = self.in_flight.as_mut() {
                in_flight.timer = Some(timer);
            }

            return Ok(LayerState::Ok);
        }

        error!("task {} failed after {} retries", id, self.timeouts.max_retries);
        if let Some(Message::Subscribe(_)) = self.in_flight.as_ref().map(|f| &f.message) {
            if let Some(filter) = self.in_flight_filter() {
                self.unregister(&filter);
            }
        }

        let packet_id = self.in_flight_id();
        if let Some(packet_id) = packet_id {
            self.ids.abandon(packet_id);
        }

        self.complete(cx, Event::TaskFailed { packet_id })?;
        Ok(LayerState::Ok)
    }

    fn on_keep_alive(&mut self, cx: &mut Cx<'_>) -> LayerResult {
        self.keep_alive_timer = None;

        if !self.state.is_connected() {
            return Ok(LayerState::Ok);
        }

        let now = cx.now()?;
        if self.keep_alive.timed_out(now) {
            error!("keep-alive timed out");
            return self.fail(crate::Error::TimedOut);
        }

        if self.keep_alive.should_ping(now) {
            self.send(cx, Message::PingReq)?;
        }

        if let Some(tick) = self.keep_alive.tick() {
            self.keep_alive_timer = Some(cx.schedule(tick, Wakeup::KeepAlive)?);
        }

        Ok(LayerState::Ok)
    }

    fn on_message(&mut self, cx: &mut Cx<'_>, message: Message) -> LayerResult {
        trace!("<- {:?}", message.packet_type());
        self.keep_alive.on_receive(cx.now()?);

        match message {
            Message::ConnAck(connack) => self.on_connack(cx, connack),
            Message::Publish(publish) => self.on_publish(cx, publish),
            Message::PubAck(id) => self.on_puback(cx, id),
            Message::PubRec(id) => self.on_pubrec(cx, id),
            Message::PubRel(id) => {
                if !self.incoming.release(id) {
                    debug!("PUBREL {} for an unknown publish", id.get());
                }
                self.send(cx, Message::PubComp(id))?;
                Ok(LayerState::Ok)
            }
            Message::PubComp(id) => self.on_pubcomp(cx, id),
            Message::SubAck(suback) => self.on_suback(cx, suback),
            Message::UnsubAck(id) => self.on_unsuback(cx, id),
            Message::PingReq => {
                self.send(cx, Message::PingResp)?;
                Ok(LayerState::Ok)
            }
            Message::PingResp => Ok(LayerState::Ok),
            other => {
                error!("unexpected {:?} from server", other.packet_type());
                self.fail(crate::Error::UnsupportedIncomingPacket)
            }
        }
    }

    fn cancel_timers(&mut self, cx: &mut Cx<'_>) {
        let timers = [
            self.connack_timer.take(),
            self.keep_alive_timer.take(),
            self.deliver_timer.take(),
            self.in_flight.as_mut().and_then(|f| f.timer.take()),
        ];

        for timer in timers.into_iter().flatten() {
            cx.cancel(timer);
        }
    }
}

impl Default for LogicLayer {
    fn default() -> Self {
        Self::new()
    }
}

fn packet_id(message: &Message) -> Option<PacketId> {
    match message {
        Message::Publish(publish) => publish.packet_id,
        Message::Subscribe(subscribe) => Some(subscribe.packet_id),
        Message::Unsubscribe(unsubscribe) => Some(unsubscribe.packet_id),
        Message::PubRel(id) => Some(*id),
        _ => None,
    }
}

impl Layer for LogicLayer {
    fn init(&mut self, cx: &mut Cx<'_>, config: &Config) -> LayerResult {
        *self = Self::new();
        self.connect = Connect::from(config);
        self.timeouts = Timeouts {
            connack_ms: config.connack_timeout_ms,
            ack_ms: config.ack_timeout_ms,
            max_retries: config.max_retries,
        };
        self.keep_alive = KeepAlive::new(config.keep_alive, cx.now()?);

        Ok(LayerState::Ok)
    }

    fn connect(&mut self, cx: &mut Cx<'_>, _endpoint: &Endpoint) -> LayerResult {
        match self.state {
            SessionState::Disconnected => {
                debug!("sending CONNECT as {}", self.connect.client_id.as_str());
                self.keep_alive = KeepAlive::new(self.connect.keep_alive, cx.now()?);
                self.send(cx, Message::Connect(self.connect.clone()))?;
                self.connack_timer =
                    Some(cx.schedule(self.timeouts.connack_ms, Wakeup::ConnackTimeout)?);
                self.state = SessionState::Connecting;
                Ok(LayerState::Incomplete)
            }
            SessionState::Connecting => Ok(LayerState::Incomplete),
            SessionState::Error => Err(crate::Error::NotConnected),
            _ => Ok(LayerState::Ok),
        }
    }

    fn data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
        match data {
            Data::Task(task) => self.enqueue(cx, task),
            other => {
                error!("session stage cannot send {}", other.kind());
                Err(crate::Error::UnexpectedData)
            }
        }
    }

    fn on_data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
        match data {
            Data::Message(message) => self.on_message(cx, message),
            Data::Wakeup(Wakeup::ConnackTimeout) => {
                self.connack_timer = None;
                if self.state != SessionState::Connecting {
                    return Ok(LayerState::Ok);
                }

                error!("no CONNACK within {} ms", self.timeouts.connack_ms);
                self.fail(crate::Error::TimedOut)
            }
            Data::Wakeup(Wakeup::AckTimeout(id)) => self.on_ack_timeout(cx, id),
            Data::Wakeup(Wakeup::KeepAlive) => self.on_keep_alive(cx),
            Data::Wakeup(Wakeup::Deliver) => {
                self.deliver();
                Ok(LayerState::Ok)
            }
            Data::Wakeup(Wakeup::Resume | Wakeup::ResponseTimeout) => Ok(LayerState::Ok),
            other => {
                error!("session stage cannot handle {}", other.kind());
                Err(crate::Error::UnexpectedData)
            }
        }
    }

    fn close(&mut self, cx: &mut Cx<'_>) -> LayerResult {
        self.cancel_timers(cx);

        if self.state.is_connected() {
            if let Err(err) = self.send(cx, Message::Disconnect) {
                warn!("could not send DISCONNECT: {:?}", err);
            }
        }

        if !self.tasks.is_empty() || self.in_flight.is_some() {
            warn!("dropping {} unfinished tasks", self.tasks.len() + self.in_flight.is_some() as usize);
        }

        self.tasks.clear();
        self.in_flight = None;
        self.inbox.clear();
        self.ids.clear();
        self.incoming.clear();

        if self.state != SessionState::Disconnected {
            cx.notify(Event::Disconnected);
        }

        self.state = SessionState::Disconnected;
        Ok(LayerState::Ok)
    }
}
