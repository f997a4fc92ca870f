use embedded_time::{Clock, duration::Milliseconds};
use heapless::Vec;

use crate::{
    chain::{Chain, LEGACY_SCHEME, LayerKind, MQTT_SCHEME, Stage},
    config::{Config, DEFAULT_TIMERS, Endpoint, MAX_DATASTREAMS, MAX_FRAME_LEN, TASK_DEPTH},
    dispatcher::{Continuation, Dispatcher, Scheduler},
    heap::Handle,
    layer::{Data, Event, Layer, LayerResult, LayerState, Wakeup},
    legacy::{Datastream, LegacyLayer, Query, Response, field},
    logic::{Handler, LogicLayer, SessionState, Task},
    packet::{QoS, publish::Publish},
};

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Protocol {
    Mqtt,
    Legacy,
}

impl Protocol {
    pub fn scheme(self) -> &'static [LayerKind] {
        match self {
            Protocol::Mqtt => MQTT_SCHEME,
            Protocol::Legacy => LEGACY_SCHEME,
        }
    }
}

pub struct Context<T: Layer, C: Clock<T = u64>, const H: usize = DEFAULT_TIMERS> {
    protocol: Protocol,
    chain: Chain<Stage<T>>,
    dispatcher: Dispatcher<C, H>,
    config: Config,
    endpoint: Option<Endpoint>,
}

impl<T: Layer, C: Clock<T = u64>, const H: usize> Context<T, C, H> {
    pub fn new(protocol: Protocol, transport: T, clock: C, config: Config) -> Result<Self, crate::Error> {
        let mut transport = Some(transport);
        let chain = Chain::from_scheme(protocol.scheme(), |kind| Stage::build(kind, &mut transport))?;

        Ok(Self {
            protocol,
            chain,
            dispatcher: Dispatcher::new(clock),
            config,
            endpoint: None,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &C {
        self.dispatcher.clock()
    }

    pub fn transport(&self) -> Option<&T> {
        match self.chain.layer(0) {
            Some(Stage::Io(transport)) => Some(transport),
            _ => None,
        }
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        match self.chain.bottom_mut() {
            Some(Stage::Io(transport)) => Some(transport),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.chain.is_connected()
    }

    /// For MQTT this is `Incomplete` until the CONNACK arrives.
    pub fn connect(&mut self, endpoint: Endpoint) -> LayerResult {
        let mut state = self.chain.init(&mut self.dispatcher, &self.config)?;
        state = state.merge(self.chain.connect(&mut self.dispatcher, &endpoint)?);
        self.endpoint = Some(endpoint);

        Ok(state)
    }

    /// The MQTT DISCONNECT is left with the transport.
    pub fn disconnect(&mut self) {
        self.chain.close(&mut self.dispatcher);
        self.dispatcher.clear();
    }

    pub fn receive(&mut self, bytes: &[u8]) -> LayerResult {
        let mut state = LayerState::Ok;
        for chunk in bytes.chunks(MAX_FRAME_LEN) {
            state = self.chain.on_data_ready(&mut self.dispatcher, Data::bytes(chunk)?)?;
            self.drain()?;
        }

        Ok(state.merge(self.settle()?))
    }

    pub fn pull(&mut self) -> LayerResult {
        self.drain()?;
        let state = self.chain.on_data_ready(&mut self.dispatcher, Data::None)?;
        self.drain()?;
        Ok(state.merge(self.settle()?))
    }

    /// At most `H` continuations per call.
    pub fn poll(&mut self) -> LayerResult {
        let mut state = LayerState::Ok;

        for _ in 0..H {
            let Some(continuation) = self.dispatcher.next_due()? else {
                break;
            };

            trace!("wake stage {}: {:?}", continuation.layer, continuation.wakeup);
            state = state.merge(self.chain.wake(&mut self.dispatcher, continuation)?);
        }

        Ok(state.merge(self.settle()?))
    }

    pub fn next_deadline(&self) -> Option<Milliseconds<u64>> {
        self.dispatcher.next_deadline()
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.chain.next_event()
    }

    pub fn session_state(&self) -> SessionState {
        self.logic()
            .map(LogicLayer::state)
            .unwrap_or(SessionState::Disconnected)
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> LayerResult {
        self.submit(Task::Publish(Publish::new(topic, payload, qos)?))
    }

    pub fn publish_retained(&mut self, topic: &str, payload: &[u8], qos: QoS) -> LayerResult {
        self.submit(Task::Publish(Publish::new(topic, payload, qos)?.with_retain(true)))
    }

    pub fn subscribe(&mut self, filter: &str, qos: QoS, handler: Handler) -> LayerResult {
        self.submit(Task::subscribe(filter, qos, handler)?)
    }

    pub fn unsubscribe(&mut self, filter: &str) -> LayerResult {
        self.submit(Task::unsubscribe(filter)?)
    }

    pub fn submit(&mut self, task: Task) -> LayerResult {
        let logic = self.logic().ok_or(crate::Error::NoSuchLayer)?;
        if logic.queued() >= TASK_DEPTH {
            return Err(crate::Error::QueueFull);
        }

        self.chain.data_ready(&mut self.dispatcher, Data::Task(task))
    }

    /// `Incomplete` until the reply comes in through `receive` or `pull`.
    pub fn request(&mut self, query: Query) -> LayerResult {
        let legacy = self.legacy().ok_or(crate::Error::NoSuchLayer)?;
        if legacy.is_waiting() {
            return Err(crate::Error::ProtocolViolation);
        }

        let endpoint = self.endpoint.clone().ok_or(crate::Error::NotConnected)?;
        self.chain.init(&mut self.dispatcher, &self.config)?;
        self.chain.connect(&mut self.dispatcher, &endpoint)?;
        self.chain.data_ready(&mut self.dispatcher, Data::Query(query))?;

        self.pull()?;
        match self.legacy() {
            Some(legacy) if legacy.is_waiting() => Ok(LayerState::Incomplete),
            _ => Ok(LayerState::Ok),
        }
    }

    pub fn response(&self) -> Option<&Response> {
        self.legacy().and_then(LegacyLayer::response)
    }

    pub fn feed_get(&mut self, feed_id: u32, datastreams: &[&str]) -> LayerResult {
        let mut ids = Vec::<_, MAX_DATASTREAMS>::new();
        for id in datastreams {
            ids.push(field(id)?).map_err(|_| crate::Error::CapacityExceeded)?;
        }

        self.request(Query::FeedGet {
            feed_id,
            datastreams: ids,
        })
    }

    pub fn feed_get_all(&mut self, feed_id: u32) -> LayerResult {
        self.request(Query::FeedGetAll { feed_id })
    }

    pub fn feed_update(&mut self, feed_id: u32, datastreams: &[Datastream]) -> LayerResult {
        let datastreams =
            Vec::from_slice(datastreams).map_err(|_| crate::Error::CapacityExceeded)?;

        self.request(Query::FeedUpdate {
            feed_id,
            datastreams,
        })
    }

    pub fn datastream_get(&mut self, feed_id: u32, datastream_id: &str) -> LayerResult {
        self.request(Query::DatastreamGet {
            feed_id,
            datastream_id: field(datastream_id)?,
        })
    }

    pub fn datastream_create(&mut self, feed_id: u32, datastream: Datastream) -> LayerResult {
        self.request(Query::DatastreamCreate {
            feed_id,
            datastream,
        })
    }

    pub fn datastream_update(&mut self, feed_id: u32, datastream: Datastream) -> LayerResult {
        self.request(Query::DatastreamUpdate {
            feed_id,
            datastream,
        })
    }

    pub fn datastream_delete(&mut self, feed_id: u32, datastream_id: &str) -> LayerResult {
        self.request(Query::DatastreamDelete {
            feed_id,
            datastream_id: field(datastream_id)?,
        })
    }

    pub fn datapoint_delete(
        &mut self,
        feed_id: u32,
        datastream_id: &str,
        timestamp: &str,
    ) -> LayerResult {
        self.request(Query::DatapointDelete {
            feed_id,
            datastream_id: field(datastream_id)?,
            timestamp: field(timestamp)?,
        })
    }

    pub fn datapoint_delete_range(
        &mut self,
        feed_id: u32,
        datastream_id: &str,
        start: &str,
        end: &str,
    ) -> LayerResult {
        self.request(Query::DatapointDeleteRange {
            feed_id,
            datastream_id: field(datastream_id)?,
            start: field(start)?,
            end: field(end)?,
        })
    }

    fn settle(&mut self) -> LayerResult {
        if !self.chain.is_open() {
            return Ok(LayerState::Ok);
        }

        match self.protocol {
            Protocol::Mqtt if !self.chain.is_connected() && self.session_state().is_connected() => {
                let Some(endpoint) = self.endpoint.clone() else {
                    return Ok(LayerState::Ok);
                };

                self.chain.connect(&mut self.dispatcher, &endpoint)
            }
            Protocol::Legacy => {
                let done = self
                    .legacy()
                    .is_some_and(|legacy| !legacy.is_waiting() && legacy.response().is_some());

                if done {
                    self.disconnect();
                }

                Ok(LayerState::Ok)
            }
            _ => Ok(LayerState::Ok),
        }
    }

    // Held-back protocol passes run here, never due handlers.
    fn drain(&mut self) -> Result<(), crate::Error> {
        while let Some((layer, handle)) = self.pending_resume() {
            self.dispatcher.cancel(handle);
            self.chain.wake(
                &mut self.dispatcher,
                Continuation {
                    layer,
                    wakeup: Wakeup::Resume,
                },
            )?;
        }

        Ok(())
    }

    fn pending_resume(&self) -> Option<(usize, Handle)> {
        if !self.chain.is_open() {
            return None;
        }

        (0..self.chain.len()).find_map(|index| match self.chain.layer(index) {
            Some(Stage::Mqtt(mqtt)) => mqtt.pending_resume().map(|handle| (index, handle)),
            _ => None,
        })
    }

    fn logic(&self) -> Option<&LogicLayer> {
        (0..self.chain.len()).find_map(|index| match self.chain.layer(index) {
            Some(Stage::MqttLogic(logic)) => Some(logic),
            _ => None,
        })
    }

    fn legacy(&self) -> Option<&LegacyLayer> {
        (0..self.chain.len()).find_map(|index| match self.chain.layer(index) {
            Some(Stage::Legacy(legacy)) => Some(legacy),
            _ => None,
        })
    }
}
