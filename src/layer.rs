use embedded_time::duration::Milliseconds;
use heapless::{Deque, Vec};

use crate::{
    config::{Config, EVENT_DEPTH, Endpoint, MAX_FRAME_LEN, QUEUE_DEPTH},
    dispatcher::{Continuation, Scheduler},
    heap::Handle,
    legacy::Query,
    logic::Task,
    packet::{Message, PacketId, QoS},
};

pub type Frame = Vec<u8, MAX_FRAME_LEN>;

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LayerState {
    Ok,
    Incomplete,
}

impl LayerState {
    pub(crate) fn merge(self, other: LayerState) -> LayerState {
        match (self, other) {
            (LayerState::Ok, LayerState::Ok) => LayerState::Ok,
            _ => LayerState::Incomplete,
        }
    }
}

/// `Err(Error::TimedOut)` takes the place of a dedicated timeout state.
pub type LayerResult = Result<LayerState, crate::Error>;

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Wakeup {
    ConnackTimeout,
    AckTimeout(u16),
    KeepAlive,
    Deliver,
    Resume,
    ResponseTimeout,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    Connected { session_present: bool },
    Published { packet_id: Option<PacketId> },
    Subscribed { packet_id: PacketId, granted: QoS },
    SubscribeFailed { packet_id: PacketId },
    Unsubscribed { packet_id: PacketId },
    TaskFailed { packet_id: Option<PacketId> },
    Response { status: u16 },
    Disconnected,
}

#[derive(Clone, Debug)]
pub enum Data {
    /// Asks the receiving stage to pull whatever it has available.
    None,
    Bytes(Frame),
    Message(Message),
    Task(Task),
    Query(Query),
    Wakeup(Wakeup),
}

impl Data {
    pub fn bytes(bytes: &[u8]) -> Result<Self, crate::Error> {
        Frame::from_slice(bytes)
            .map(Data::Bytes)
            .map_err(|_| crate::Error::BufferTooSmall)
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Data::None => "none",
            Data::Bytes(_) => "bytes",
            Data::Message(_) => "message",
            Data::Task(_) => "task",
            Data::Query(_) => "query",
            Data::Wakeup(_) => "wakeup",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Direction {
    Down,
    Up,
}

#[derive(Debug)]
pub(crate) struct Pending {
    pub(crate) layer: usize,
    pub(crate) direction: Direction,
    pub(crate) data: Data,
}

pub struct Cx<'c> {
    index: usize,
    len: usize,
    queue: &'c mut Deque<Pending, QUEUE_DEPTH>,
    events: &'c mut Deque<Event, EVENT_DEPTH>,
    scheduler: &'c mut dyn Scheduler,
}

impl<'c> Cx<'c> {
    pub(crate) fn new(
        index: usize,
        len: usize,
        queue: &'c mut Deque<Pending, QUEUE_DEPTH>,
        events: &'c mut Deque<Event, EVENT_DEPTH>,
        scheduler: &'c mut dyn Scheduler,
    ) -> Self {
        Self {
            index,
            len,
            queue,
            events,
            scheduler,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_top(&self) -> bool {
        self.index + 1 == self.len
    }

    pub fn forward_down(&mut self, data: Data) -> Result<(), crate::Error> {
        let layer = self.index.checked_sub(1).ok_or(crate::Error::NoSuchLayer)?;
        self.push(layer, Direction::Down, data)
    }

    pub fn forward_up(&mut self, data: Data) -> Result<(), crate::Error> {
        if self.is_top() {
            return Err(crate::Error::NoSuchLayer);
        }

        self.push(self.index + 1, Direction::Up, data)
    }

    /// Free slots left in the chain's work queue.
    pub fn room(&self) -> usize {
        QUEUE_DEPTH - self.queue.len()
    }

    pub fn notify(&mut self, event: Event) {
        if self.events.is_full() {
            warn!("event queue full, dropping oldest");
            self.events.pop_front();
        }

        let _ = self.events.push_back(event);
    }

    pub fn now(&self) -> Result<Milliseconds<u64>, crate::Error> {
        self.scheduler.now()
    }

    pub fn schedule(&mut self, delay_ms: u32, wakeup: Wakeup) -> Result<Handle, crate::Error> {
        let continuation = Continuation {
            layer: self.index,
            wakeup,
        };

        self.scheduler.schedule(Milliseconds(delay_ms), continuation)
    }

    pub fn defer(&mut self, wakeup: Wakeup) -> Result<Handle, crate::Error> {
        self.schedule(0, wakeup)
    }

    pub fn cancel(&mut self, handle: Handle) -> bool {
        self.scheduler.cancel(handle)
    }

    fn push(&mut self, layer: usize, direction: Direction, data: Data) -> Result<(), crate::Error> {
        self.queue
            .push_back(Pending {
                layer,
                direction,
                data,
            })
            .map_err(|_| crate::Error::QueueFull)
    }
}

/// Defaults pass data through unchanged.
pub trait Layer {
    fn init(&mut self, _cx: &mut Cx<'_>, _config: &Config) -> LayerResult {
        Ok(LayerState::Ok)
    }

    fn connect(&mut self, _cx: &mut Cx<'_>, _endpoint: &Endpoint) -> LayerResult {
        Ok(LayerState::Ok)
    }

    fn data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
        cx.forward_down(data)?;
        Ok(LayerState::Ok)
    }

    fn on_data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
        cx.forward_up(data)?;
        Ok(LayerState::Ok)
    }

    fn close(&mut self, _cx: &mut Cx<'_>) -> LayerResult {
        Ok(LayerState::Ok)
    }

    fn on_close(&mut self, _cx: &mut Cx<'_>) -> LayerResult {
        Ok(LayerState::Ok)
    }
}
