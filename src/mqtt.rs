use core::mem;

use crate::{
    config::{MAX_FRAME_LEN, QUEUE_DEPTH},
    heap::Handle,
    layer::{Cx, Data, Frame, Layer, LayerResult, LayerState, Wakeup},
    packet::{Message, serialize},
    parser::{ParseStatus, Parser},
};

/// Messages forwarded up per pass before the rest is deferred.
const BURST: usize = QUEUE_DEPTH / 2;

pub struct MqttLayer {
    parser: Parser,
    message: Message,
    backlog: Frame,
    resume: Option<Handle>,
}

impl MqttLayer {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            message: Message::default(),
            backlog: Frame::new(),
            resume: None,
        }
    }

    pub fn pending_resume(&self) -> Option<Handle> {
        self.resume
    }

    fn encode(message: &Message) -> Result<Frame, crate::Error> {
        let mut frame = Frame::new();
        frame
            .resize(MAX_FRAME_LEN, 0)
            .map_err(|_| crate::Error::BufferTooSmall)?;

        let len = serialize(message, &mut frame)?;
        frame.truncate(len);

        Ok(frame)
    }

    /// Parses as much of `bytes` as the work queue allows and keeps the rest.
    fn feed(&mut self, cx: &mut Cx<'_>, bytes: &[u8]) -> LayerResult {
        let mut offset = 0;

        while offset < bytes.len() {
            if cx.room() <= BURST {
                return self.stash(cx, &bytes[offset..]);
            }

            let status = self.parser.execute(&mut self.message, &bytes[offset..]);
            offset += self.parser.consumed();

            match status? {
                ParseStatus::Done => {
                    trace!("decoded {:?}", self.message.packet_type());
                    cx.forward_up(Data::Message(mem::take(&mut self.message)))?;
                }
                ParseStatus::WantMemory(size) => {
                    warn!("dropping packet with a {} byte field", size);
                    self.parser.discard();
                }
                ParseStatus::Continue | ParseStatus::Incomplete => {}
            }
        }

        if self.parser.is_idle() {
            Ok(LayerState::Ok)
        } else {
            Ok(LayerState::Incomplete)
        }
    }

    fn stash(&mut self, cx: &mut Cx<'_>, rest: &[u8]) -> LayerResult {
        self.backlog
            .extend_from_slice(rest)
            .map_err(|_| crate::Error::BufferTooSmall)?;

        if self.resume.is_none() {
            self.resume = Some(cx.defer(Wakeup::Resume)?);
        }

        debug!("{} bytes left for the next pass", self.backlog.len());
        Ok(LayerState::Incomplete)
    }
}

impl Default for MqttLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for MqttLayer {
    fn data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
        match data {
            Data::Message(message) => {
                let frame = Self::encode(&message)?;
                trace!("sending {:?}, {} bytes", message.packet_type(), frame.len());

                cx.forward_down(Data::Bytes(frame))?;
                Ok(LayerState::Ok)
            }
            other => {
                error!("protocol stage cannot send {}", other.kind());
                Err(crate::Error::UnexpectedData)
            }
        }
    }

    fn on_data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
        match data {
            // Keep arrival order behind an unfinished backlog.
            Data::Bytes(bytes) if !self.backlog.is_empty() => self.stash(cx, &bytes),
            Data::Bytes(bytes) => self.feed(cx, &bytes),
            Data::Wakeup(Wakeup::Resume) => {
                self.resume = None;
                let backlog = mem::take(&mut self.backlog);
                self.feed(cx, &backlog)
            }
            Data::Wakeup(wakeup) => {
                warn!("protocol stage ignoring {:?}", wakeup);
                Ok(LayerState::Ok)
            }
            other => {
                error!("protocol stage cannot parse {}", other.kind());
                Err(crate::Error::UnexpectedData)
            }
        }
    }

    fn close(&mut self, cx: &mut Cx<'_>) -> LayerResult {
        if let Some(handle) = self.resume.take() {
            cx.cancel(handle);
        }

        self.parser.reset();
        self.backlog.clear();
        self.message = Message::default();

        Ok(LayerState::Ok)
    }
}
