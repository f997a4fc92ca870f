use heapless::Vec;

use crate::{
    config::{Endpoint, MAX_FRAME_LEN},
    layer::{Cx, Data, Frame, Layer, LayerResult, LayerState},
};

pub const TX_CAPACITY: usize = 2 * MAX_FRAME_LEN;

#[derive(Default)]
pub struct Channel {
    outgoing: Vec<u8, TX_CAPACITY>,
    incoming: Frame,
    endpoint: Option<Endpoint>,
    open: bool,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outgoing(&self) -> &[u8] {
        &self.outgoing
    }

    /// Drops the first `written` outbound bytes once the host has sent them.
    pub fn consume(&mut self, written: usize) {
        let written = written.min(self.outgoing.len());
        self.outgoing.copy_within(written.., 0);
        self.outgoing.truncate(self.outgoing.len() - written);
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), crate::Error> {
        self.incoming
            .extend_from_slice(bytes)
            .map_err(|_| crate::Error::BufferTooSmall)
    }

    /// Where the chain asked to connect, while open.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref().filter(|_| self.open)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl Layer for Channel {
    fn init(&mut self, _cx: &mut Cx<'_>, _config: &crate::config::Config) -> LayerResult {
        self.outgoing.clear();
        self.incoming.clear();
        Ok(LayerState::Ok)
    }

    fn connect(&mut self, _cx: &mut Cx<'_>, endpoint: &Endpoint) -> LayerResult {
        debug!("link to {}:{}", endpoint.host.as_str(), endpoint.port);
        self.endpoint = Some(endpoint.clone());
        self.open = true;

        Ok(LayerState::Ok)
    }

    fn data_ready(&mut self, _cx: &mut Cx<'_>, data: Data) -> LayerResult {
        let Data::Bytes(bytes) = data else {
            return Err(crate::Error::UnexpectedData);
        };

        self.outgoing.extend_from_slice(&bytes).map_err(|_| {
            warn!("outbound buffer full, {} bytes pending", self.outgoing.len());
            crate::Error::BufferTooSmall
        })?;

        Ok(LayerState::Ok)
    }

    fn on_data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
        match data {
            Data::Bytes(bytes) => cx.forward_up(Data::Bytes(bytes))?,
            Data::None if self.incoming.is_empty() => return Ok(LayerState::Incomplete),
            Data::None => {
                let bytes = core::mem::take(&mut self.incoming);
                cx.forward_up(Data::Bytes(bytes))?;
            }
            _ => return Err(crate::Error::UnexpectedData),
        }

        Ok(LayerState::Ok)
    }

    fn close(&mut self, _cx: &mut Cx<'_>) -> LayerResult {
        // Outbound bytes stay so the host can still flush a DISCONNECT.
        self.incoming.clear();
        self.open = false;

        Ok(LayerState::Ok)
    }
}
