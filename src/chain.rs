use heapless::{Deque, Vec};

use crate::{
    config::{Config, EVENT_DEPTH, Endpoint, MAX_LAYERS, QUEUE_DEPTH},
    dispatcher::{Continuation, Scheduler},
    layer::{Cx, Data, Direction, Event, Layer, LayerResult, LayerState, Pending},
    legacy::LegacyLayer,
    logic::LogicLayer,
    mqtt::MqttLayer,
};

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LayerKind {
    Io,
    Mqtt,
    MqttLogic,
    Legacy,
}

pub const MQTT_SCHEME: &[LayerKind] = &[LayerKind::Io, LayerKind::Mqtt, LayerKind::MqttLogic];
pub const LEGACY_SCHEME: &[LayerKind] = &[LayerKind::Io, LayerKind::Legacy];

pub struct Chain<L, const N: usize = MAX_LAYERS> {
    layers: Vec<L, N>,
    initialized: usize,
    connected: usize,
    closed: [bool; N],
    on_closed: [bool; N],
    queue: Deque<Pending, QUEUE_DEPTH>,
    events: Deque<Event, EVENT_DEPTH>,
}

impl<L: Layer, const N: usize> Chain<L, N> {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            initialized: 0,
            connected: 0,
            closed: [false; N],
            on_closed: [false; N],
            queue: Deque::new(),
            events: Deque::new(),
        }
    }

    pub fn from_scheme<F>(scheme: &[LayerKind], mut factory: F) -> Result<Self, crate::Error>
    where
        F: FnMut(LayerKind) -> Result<L, crate::Error>,
    {
        let mut chain = Self::new();

        for kind in scheme {
            chain.push(factory(*kind)?)?;
        }

        debug!("chain built with {} stages", chain.len());
        Ok(chain)
    }

    pub fn push(&mut self, layer: L) -> Result<(), crate::Error> {
        if self.initialized > 0 {
            return Err(crate::Error::ProtocolViolation);
        }

        self.layers
            .push(layer)
            .map_err(|_| crate::Error::CapacityExceeded)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn is_open(&self) -> bool {
        !self.layers.is_empty() && self.initialized == self.layers.len()
    }

    pub fn is_connected(&self) -> bool {
        self.is_open() && self.connected == self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Option<&L> {
        self.layers.get(index)
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut L> {
        self.layers.get_mut(index)
    }

    pub fn top(&self) -> Option<&L> {
        self.layers.last()
    }

    pub fn bottom_mut(&mut self) -> Option<&mut L> {
        self.layers.first_mut()
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn init(&mut self, sched: &mut dyn Scheduler, config: &Config) -> LayerResult {
        if self.is_open() {
            return Ok(LayerState::Ok);
        }

        self.initialized = 0;
        self.connected = 0;
        self.closed = [false; N];
        self.on_closed = [false; N];
        self.queue.clear();

        let mut state = LayerState::Ok;
        for index in 0..self.layers.len() {
            let result = self.call(index, sched, |layer, cx| layer.init(cx, config));

            match result {
                Ok(s) => {
                    self.initialized = index + 1;
                    state = state.merge(s);
                }
                Err(err) => {
                    error!("init failed at stage {}: {:?}", index, err);
                    self.fail(sched);
                    return Err(err);
                }
            }

            state = state.merge(self.run(sched)?);
        }

        Ok(state)
    }

    /// Connects stages bottom to top. A stage answering `Incomplete` pauses
    /// propagation; calling again resumes from that stage.
    pub fn connect(&mut self, sched: &mut dyn Scheduler, endpoint: &Endpoint) -> LayerResult {
        if !self.is_open() {
            return Err(crate::Error::ChainClosed);
        }

        while self.connected < self.layers.len() {
            let index = self.connected;
            let result = self.call(index, sched, |layer, cx| layer.connect(cx, endpoint));

            let state = match result {
                Ok(state) => state,
                Err(err) => {
                    error!("connect failed at stage {}: {:?}", index, err);
                    self.fail(sched);
                    return Err(err);
                }
            };

            let drained = self.run(sched)?;

            if state == LayerState::Incomplete {
                return Ok(LayerState::Incomplete);
            }

            self.connected = index + 1;

            if drained == LayerState::Incomplete {
                return Ok(LayerState::Incomplete);
            }
        }

        Ok(LayerState::Ok)
    }

    pub fn data_ready(&mut self, sched: &mut dyn Scheduler, data: Data) -> LayerResult {
        let top = self.layers.len().checked_sub(1).ok_or(crate::Error::NoSuchLayer)?;
        self.enter(sched, top, Direction::Down, data)
    }

    pub fn on_data_ready(&mut self, sched: &mut dyn Scheduler, data: Data) -> LayerResult {
        self.enter(sched, 0, Direction::Up, data)
    }

    pub fn wake(&mut self, sched: &mut dyn Scheduler, continuation: Continuation) -> LayerResult {
        if !self.is_open() {
            debug!("dropping {:?}, chain closed", continuation.wakeup);
            return Ok(LayerState::Ok);
        }

        if continuation.layer >= self.layers.len() {
            return Err(crate::Error::NoSuchLayer);
        }

        self.enter(
            sched,
            continuation.layer,
            Direction::Up,
            Data::Wakeup(continuation.wakeup),
        )
    }

    /// `close` top to bottom, then `on_close` bottom to top.
    pub fn close(&mut self, sched: &mut dyn Scheduler) {
        if self.initialized == 0 {
            return;
        }

        debug!("closing chain");
        self.unwind(sched, true);
    }

    fn enter(
        &mut self,
        sched: &mut dyn Scheduler,
        layer: usize,
        direction: Direction,
        data: Data,
    ) -> LayerResult {
        if !self.is_open() {
            return Err(crate::Error::ChainClosed);
        }

        self.queue
            .push_back(Pending {
                layer,
                direction,
                data,
            })
            .map_err(|_| crate::Error::QueueFull)?;

        self.run(sched)
    }

    fn run(&mut self, sched: &mut dyn Scheduler) -> LayerResult {
        let mut state = LayerState::Ok;

        while let Some(pending) = self.queue.pop_front() {
            let layer = pending.layer;

            match self.dispatch(sched, pending) {
                Ok(s) => state = state.merge(s),
                Err(err) => {
                    error!("stage {} failed: {:?}", layer, err);
                    self.fail(sched);
                    return Err(err);
                }
            }
        }

        Ok(state)
    }

    fn dispatch(&mut self, sched: &mut dyn Scheduler, pending: Pending) -> LayerResult {
        let Pending {
            layer,
            direction,
            data,
        } = pending;
        trace!("stage {} {:?} {}", layer, direction, data.kind());

        self.call(layer, sched, |stage, cx| match direction {
            Direction::Down => stage.data_ready(cx, data),
            Direction::Up => stage.on_data_ready(cx, data),
        })
    }

    fn fail(&mut self, sched: &mut dyn Scheduler) {
        self.queue.clear();
        self.unwind(sched, false);
    }

    fn unwind(&mut self, sched: &mut dyn Scheduler, graceful: bool) {
        let count = self.initialized;

        for index in (0..count).rev() {
            if core::mem::replace(&mut self.closed[index], true) {
                continue;
            }

            let result = self.call(index, sched, |layer, cx| layer.close(cx));
            if let Err(err) = result {
                warn!("close failed at stage {}: {:?}", index, err);
            }

            if graceful {
                self.drain_closing(sched);
            } else {
                self.queue.clear();
            }
        }

        for index in 0..count {
            if core::mem::replace(&mut self.on_closed[index], true) {
                continue;
            }

            let result = self.call(index, sched, |layer, cx| layer.on_close(cx));
            if let Err(err) = result {
                warn!("on_close failed at stage {}: {:?}", index, err);
            }

            self.queue.clear();
        }

        self.initialized = 0;
        self.connected = 0;
    }

    fn drain_closing(&mut self, sched: &mut dyn Scheduler) {
        while let Some(pending) = self.queue.pop_front() {
            if self.closed[pending.layer] {
                continue;
            }

            if let Err(err) = self.dispatch(sched, pending) {
                warn!("dropping queued work while closing: {:?}", err);
                self.queue.clear();
            }
        }
    }

    fn call<F>(&mut self, index: usize, sched: &mut dyn Scheduler, f: F) -> LayerResult
    where
        F: FnOnce(&mut L, &mut Cx<'_>) -> LayerResult,
    {
        let len = self.layers.len();
        let mut cx = Cx::new(index, len, &mut self.queue, &mut self.events, sched);

        f(&mut self.layers[index], &mut cx)
    }
}

impl<L: Layer, const N: usize> Default for Chain<L, N> {
    fn default() -> Self {
        Self::new()
    }
}

pub enum Stage<T> {
    Io(T),
    Mqtt(MqttLayer),
    MqttLogic(LogicLayer),
    Legacy(LegacyLayer),
}

impl<T: Layer> Stage<T> {
    /// The transport is moved into the first `Io` entry.
    pub fn build(kind: LayerKind, transport: &mut Option<T>) -> Result<Self, crate::Error> {
        let stage = match kind {
            LayerKind::Io => Stage::Io(transport.take().ok_or(crate::Error::NoSuchLayer)?),
            LayerKind::Mqtt => Stage::Mqtt(MqttLayer::new()),
            LayerKind::MqttLogic => Stage::MqttLogic(LogicLayer::new()),
            LayerKind::Legacy => Stage::Legacy(LegacyLayer::new()),
        };

        Ok(stage)
    }

    fn as_layer(&mut self) -> &mut dyn Layer {
        match self {
            Stage::Io(layer) => layer,
            Stage::Mqtt(layer) => layer,
            Stage::MqttLogic(layer) => layer,
            Stage::Legacy(layer) => layer,
        }
    }
}

impl<T: Layer> Layer for Stage<T> {
    fn init(&mut self, cx: &mut Cx<'_>, config: &Config) -> LayerResult {
        self.as_layer().init(cx, config)
    }

    fn connect(&mut self, cx: &mut Cx<'_>, endpoint: &Endpoint) -> LayerResult {
        self.as_layer().connect(cx, endpoint)
    }

    fn data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
        self.as_layer().data_ready(cx, data)
    }

    fn on_data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
        self.as_layer().on_data_ready(cx, data)
    }

    fn close(&mut self, cx: &mut Cx<'_>) -> LayerResult {
        self.as_layer().close(cx)
    }

    fn on_close(&mut self, cx: &mut Cx<'_>) -> LayerResult {
        self.as_layer().on_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, vec::Vec as StdVec};

    use super::*;
    use crate::{dispatcher::Dispatcher, time::ManualClock};

    type Log = Rc<RefCell<StdVec<(usize, &'static str)>>>;

    struct Probe {
        id: usize,
        log: Log,
        fail_data_ready: bool,
        fail_init: bool,
    }

    impl Probe {
        fn new(id: usize, log: &Log) -> Self {
            Self {
                id,
                log: log.clone(),
                fail_data_ready: false,
                fail_init: false,
            }
        }

        fn record(&self, what: &'static str) {
            self.log.borrow_mut().push((self.id, what));
        }
    }

    impl Layer for Probe {
        fn init(&mut self, _cx: &mut Cx<'_>, _config: &Config) -> LayerResult {
            self.record("init");
            if self.fail_init {
                return Err(crate::Error::CapacityExceeded);
            }
            Ok(LayerState::Ok)
        }

        fn connect(&mut self, _cx: &mut Cx<'_>, _endpoint: &Endpoint) -> LayerResult {
            self.record("connect");
            Ok(LayerState::Ok)
        }

        fn data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
            self.record("data_ready");
            if self.fail_data_ready {
                return Err(crate::Error::TransportError);
            }

            if cx.index() == 0 {
                // Loop the data back up like an echoing transport.
                self.on_data_ready(cx, data)
            } else {
                cx.forward_down(data)?;
                Ok(LayerState::Ok)
            }
        }

        fn on_data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
            self.record("on_data_ready");
            if cx.is_top() {
                return Ok(LayerState::Ok);
            }
            cx.forward_up(data)?;
            Ok(LayerState::Ok)
        }

        fn close(&mut self, _cx: &mut Cx<'_>) -> LayerResult {
            self.record("close");
            Ok(LayerState::Ok)
        }

        fn on_close(&mut self, _cx: &mut Cx<'_>) -> LayerResult {
            self.record("on_close");
            Ok(LayerState::Ok)
        }
    }

    fn chain_of(log: &Log, n: usize) -> Chain<Probe> {
        let mut chain = Chain::new();
        for id in 0..n {
            chain.push(Probe::new(id, log)).unwrap();
        }
        chain
    }

    fn calls(log: &Log, what: &str) -> StdVec<usize> {
        log.borrow()
            .iter()
            .filter(|(_, w)| *w == what)
            .map(|(id, _)| *id)
            .collect()
    }

    fn setup() -> (Log, Dispatcher<ManualClock, 4>, Config, Endpoint) {
        (
            Rc::new(RefCell::new(StdVec::new())),
            Dispatcher::new(ManualClock::new()),
            Config::new("probe").unwrap(),
            Endpoint::new("localhost", 1883).unwrap(),
        )
    }

    #[test]
    fn init_and_connect_run_bottom_up() {
        let (log, mut sched, config, endpoint) = setup();
        let mut chain = chain_of(&log, 3);

        chain.init(&mut sched, &config).unwrap();
        chain.connect(&mut sched, &endpoint).unwrap();

        assert_eq!(calls(&log, "init"), [0, 1, 2]);
        assert_eq!(calls(&log, "connect"), [0, 1, 2]);
        assert!(chain.is_connected());
    }

    #[test]
    fn data_travels_down_then_up() {
        let (log, mut sched, config, _) = setup();
        let mut chain = chain_of(&log, 3);
        chain.init(&mut sched, &config).unwrap();

        chain.data_ready(&mut sched, Data::bytes(b"x").unwrap()).unwrap();

        assert_eq!(calls(&log, "data_ready"), [2, 1, 0]);
        assert_eq!(calls(&log, "on_data_ready"), [0, 1, 2]);
    }

    #[test]
    fn data_ready_error_unwinds_once() {
        for failing in 0..3 {
            let (log, mut sched, config, _) = setup();
            let mut chain = chain_of(&log, 3);
            chain.layer_mut(failing).unwrap().fail_data_ready = true;
            chain.init(&mut sched, &config).unwrap();

            let result = chain.data_ready(&mut sched, Data::bytes(b"x").unwrap());

            assert_eq!(result, Err(crate::Error::TransportError));
            assert!(calls(&log, "on_data_ready").is_empty());
            assert_eq!(calls(&log, "close"), [2, 1, 0]);
            assert_eq!(calls(&log, "on_close"), [0, 1, 2]);
            assert!(!chain.is_open());

            // Nothing runs twice on an explicit close afterwards.
            chain.close(&mut sched);
            assert_eq!(calls(&log, "close").len(), 3);
            assert_eq!(
                chain.data_ready(&mut sched, Data::None),
                Err(crate::Error::ChainClosed)
            );
        }
    }

    #[test]
    fn init_failure_unwinds_constructed_stages_only() {
        let (log, mut sched, config, _) = setup();
        let mut chain = chain_of(&log, 3);
        chain.layer_mut(1).unwrap().fail_init = true;

        assert_eq!(
            chain.init(&mut sched, &config),
            Err(crate::Error::CapacityExceeded)
        );
        assert_eq!(calls(&log, "init"), [0, 1]);
        assert_eq!(calls(&log, "close"), [0]);
        assert_eq!(calls(&log, "on_close"), [0]);
    }

    #[test]
    fn closed_chain_can_reopen() {
        let (log, mut sched, config, _) = setup();
        let mut chain = chain_of(&log, 2);

        chain.init(&mut sched, &config).unwrap();
        chain.close(&mut sched);
        chain.init(&mut sched, &config).unwrap();
        chain.close(&mut sched);

        assert_eq!(calls(&log, "init"), [0, 1, 0, 1]);
        assert_eq!(calls(&log, "close"), [1, 0, 1, 0]);
        assert_eq!(calls(&log, "on_close"), [0, 1, 0, 1]);
    }

    #[test]
    fn scheme_factory_builds_in_order() {
        let kinds = RefCell::new(StdVec::new());
        let log: Log = Rc::new(RefCell::new(StdVec::new()));

        let chain = Chain::<Probe>::from_scheme(MQTT_SCHEME, |kind| {
            kinds.borrow_mut().push(kind);
            Ok(Probe::new(kinds.borrow().len() - 1, &log))
        })
        .unwrap();

        assert_eq!(chain.len(), 3);
        assert_eq!(
            *kinds.borrow(),
            [LayerKind::Io, LayerKind::Mqtt, LayerKind::MqttLogic]
        );
    }

    #[test]
    fn wake_reaches_scheduling_stage() {
        let (log, mut sched, config, _) = setup();
        let mut chain = chain_of(&log, 3);
        chain.init(&mut sched, &config).unwrap();

        let continuation = Continuation {
            layer: 2,
            wakeup: crate::layer::Wakeup::Deliver,
        };
        chain.wake(&mut sched, continuation).unwrap();

        assert_eq!(calls(&log, "on_data_ready"), [2]);
    }
}
