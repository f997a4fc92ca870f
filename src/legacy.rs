use core::fmt::{self, Write};

use heapless::{String, Vec};

use crate::{
    config::{
        Config, Endpoint, MAX_API_KEY_LEN, MAX_DATASTREAMS, MAX_FIELD_LEN, MAX_FRAME_LEN,
        MAX_HOST_LEN, MAX_PAYLOAD_LEN,
    },
    heap::Handle,
    layer::{Cx, Data, Event, Frame, Layer, LayerResult, LayerState, Wakeup},
};

pub type Field = String<MAX_FIELD_LEN>;

const MAX_PATH_LEN: usize = 192;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    F32(f32),
    Str(Field),
}

impl Value {
    /// Integers first, then decimals, anything else stays a string.
    pub fn parse(text: &str) -> Result<Self, crate::Error> {
        if let Ok(value) = text.parse::<i32>() {
            return Ok(Value::I32(value));
        }

        let numeric = !text.is_empty()
            && text
                .bytes()
                .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'));
        if numeric {
            if let Ok(value) = text.parse::<f32>() {
                return Ok(Value::F32(value));
            }
        }

        field(text).map(Value::Str)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(value) => write!(f, "{}", value),
            Value::F32(value) => write!(f, "{}", value),
            Value::Str(value) => f.write_str(value),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Datapoint {
    pub timestamp: Option<Field>,
    pub value: Value,
}

impl Datapoint {
    pub fn new(value: Value) -> Self {
        Self {
            timestamp: None,
            value,
        }
    }

    pub fn at(timestamp: &str, value: Value) -> Result<Self, crate::Error> {
        Ok(Self {
            timestamp: Some(field(timestamp)?),
            value,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Datastream {
    pub id: Field,
    pub datapoint: Datapoint,
}

impl Datastream {
    pub fn new(id: &str, datapoint: Datapoint) -> Result<Self, crate::Error> {
        Ok(Self {
            id: field(id)?,
            datapoint,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    FeedGet {
        feed_id: u32,
        datastreams: Vec<Field, MAX_DATASTREAMS>,
    },
    FeedGetAll {
        feed_id: u32,
    },
    FeedUpdate {
        feed_id: u32,
        datastreams: Vec<Datastream, MAX_DATASTREAMS>,
    },
    DatastreamGet {
        feed_id: u32,
        datastream_id: Field,
    },
    DatastreamCreate {
        feed_id: u32,
        datastream: Datastream,
    },
    DatastreamUpdate {
        feed_id: u32,
        datastream: Datastream,
    },
    DatastreamDelete {
        feed_id: u32,
        datastream_id: Field,
    },
    DatapointDelete {
        feed_id: u32,
        datastream_id: Field,
        timestamp: Field,
    },
    DatapointDeleteRange {
        feed_id: u32,
        datastream_id: Field,
        start: Field,
        end: Field,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Response {
    pub status: u16,
    /// Rows of the CSV body. Rows without an id column have an empty id.
    pub datastreams: Vec<Datastream, MAX_DATASTREAMS>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub(crate) fn field(text: &str) -> Result<Field, crate::Error> {
    String::try_from(text).map_err(|_| crate::Error::BufferTooSmall)
}

fn overflow(_: fmt::Error) -> crate::Error {
    crate::Error::BufferTooSmall
}

fn write_row<W: Write>(out: &mut W, id: Option<&str>, datapoint: &Datapoint) -> fmt::Result {
    if let Some(id) = id {
        write!(out, "{},", id)?;
    }

    if let Some(timestamp) = &datapoint.timestamp {
        write!(out, "{},", timestamp)?;
    }

    writeln!(out, "{}", datapoint.value)
}

fn describe(
    query: &Query,
    path: &mut String<MAX_PATH_LEN>,
    body: &mut String<MAX_PAYLOAD_LEN>,
) -> Result<&'static str, fmt::Error> {
    let method = match query {
        Query::FeedGet {
            feed_id,
            datastreams,
        } => {
            write!(path, "/v2/feeds/{}.csv", feed_id)?;
            for (i, id) in datastreams.iter().enumerate() {
                let separator = if i == 0 { "?datastreams=" } else { "," };
                write!(path, "{}{}", separator, id)?;
            }
            "GET"
        }
        Query::FeedGetAll { feed_id } => {
            write!(path, "/v2/feeds/{}.csv", feed_id)?;
            "GET"
        }
        Query::FeedUpdate {
            feed_id,
            datastreams,
        } => {
            write!(path, "/v2/feeds/{}.csv", feed_id)?;
            for datastream in datastreams {
                write_row(body, Some(datastream.id.as_str()), &datastream.datapoint)?;
            }
            "PUT"
        }
        Query::DatastreamGet {
            feed_id,
            datastream_id,
        } => {
            write!(path, "/v2/feeds/{}/datastreams/{}.csv", feed_id, datastream_id)?;
            "GET"
        }
        Query::DatastreamCreate {
            feed_id,
            datastream,
        } => {
            write!(path, "/v2/feeds/{}/datastreams.csv", feed_id)?;
            write_row(body, Some(datastream.id.as_str()), &datastream.datapoint)?;
            "POST"
        }
        Query::DatastreamUpdate {
            feed_id,
            datastream,
        } => {
            write!(
                path,
                "/v2/feeds/{}/datastreams/{}.csv",
                feed_id, datastream.id
            )?;
            write_row(body, None, &datastream.datapoint)?;
            "PUT"
        }
        Query::DatastreamDelete {
            feed_id,
            datastream_id,
        } => {
            write!(path, "/v2/feeds/{}/datastreams/{}.csv", feed_id, datastream_id)?;
            "DELETE"
        }
        Query::DatapointDelete {
            feed_id,
            datastream_id,
            timestamp,
        } => {
            write!(
                path,
                "/v2/feeds/{}/datastreams/{}/datapoints/{}.csv",
                feed_id, datastream_id, timestamp
            )?;
            "DELETE"
        }
        Query::DatapointDeleteRange {
            feed_id,
            datastream_id,
            start,
            end,
        } => {
            write!(
                path,
                "/v2/feeds/{}/datastreams/{}/datapoints.csv?start={}&end={}",
                feed_id, datastream_id, start, end
            )?;
            "DELETE"
        }
    };

    Ok(method)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parses a complete reply, or returns `None` while bytes are missing.
/// Without `Content-Length` the body runs until the connection is `closed`.
fn parse_reply(reply: &[u8], closed: bool) -> Result<Option<Response>, crate::Error> {
    let Some(head_end) = find(reply, b"\r\n\r\n") else {
        return Ok(None);
    };

    let head = core::str::from_utf8(&reply[..head_end])
        .map_err(|_| crate::Error::MalformedResponse)?;
    let mut lines = head.split("\r\n");

    let mut status_line = lines.next().unwrap_or_default().splitn(3, ' ');
    if !status_line.next().unwrap_or_default().starts_with("HTTP/1.") {
        return Err(crate::Error::MalformedResponse);
    }
    let status = status_line
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or(crate::Error::MalformedResponse)?;

    let mut content_length = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let length = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| crate::Error::MalformedResponse)?;
                content_length = Some(length);
            }
        }
    }

    let body = &reply[head_end + 4..];
    let body = match content_length {
        Some(length) if body.len() < length => return Ok(None),
        Some(length) => &body[..length],
        None if closed || matches!(status, 204 | 304) => body,
        None => return Ok(None),
    };

    let mut response = Response {
        status,
        datastreams: Vec::new(),
    };

    if response.is_success() {
        let body = core::str::from_utf8(body).map_err(|_| crate::Error::MalformedResponse)?;
        parse_rows(body, &mut response.datastreams)?;
    }

    Ok(Some(response))
}

fn parse_rows(
    body: &str,
    rows: &mut Vec<Datastream, MAX_DATASTREAMS>,
) -> Result<(), crate::Error> {
    for line in body.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let columns: Vec<&str, 3> = line.splitn(3, ',').collect();

        let (id, timestamp, value) = match columns.as_slice() {
            [id, timestamp, value] => (*id, Some(*timestamp), *value),
            [timestamp, value] => ("", Some(*timestamp), *value),
            [value] => ("", None, *value),
            _ => return Err(crate::Error::MalformedResponse),
        };

        let datapoint = Datapoint {
            timestamp: timestamp.map(field).transpose()?,
            value: Value::parse(value)?,
        };

        if rows.push(Datastream::new(id, datapoint)?).is_err() {
            warn!("dropping datastream rows beyond {}", MAX_DATASTREAMS);
            break;
        }
    }

    Ok(())
}

pub struct LegacyLayer {
    host: String<MAX_HOST_LEN>,
    api_key: String<MAX_API_KEY_LEN>,
    timeout_ms: u32,
    reply: Frame,
    waiting: bool,
    timer: Option<Handle>,
    response: Option<Response>,
}

impl LegacyLayer {
    pub fn new() -> Self {
        Self {
            host: String::new(),
            api_key: String::new(),
            timeout_ms: 0,
            reply: Frame::new(),
            waiting: false,
            timer: None,
            response: None,
        }
    }

    /// Last complete response. Survives `close`.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    fn complete(&mut self, cx: &mut Cx<'_>, response: Response) {
        if let Some(timer) = self.timer.take() {
            cx.cancel(timer);
        }

        info!("response {}", response.status);
        cx.notify(Event::Response {
            status: response.status,
        });

        self.response = Some(response);
        self.reply.clear();
        self.waiting = false;
    }

    fn request(&self, query: &Query) -> Result<Frame, crate::Error> {
        let mut path = String::<MAX_PATH_LEN>::new();
        let mut body = String::<MAX_PAYLOAD_LEN>::new();
        let method = describe(query, &mut path, &mut body).map_err(overflow)?;

        let mut request = String::<MAX_FRAME_LEN>::new();
        write!(
            request,
            "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}/{}\r\nAccept: */*\r\nX-ApiKey: {}\r\n",
            method,
            path,
            self.host,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.api_key
        )
        .map_err(overflow)?;

        if !body.is_empty() {
            request
                .push_str("Content-Type: text/csv\r\n")
                .map_err(|_| crate::Error::BufferTooSmall)?;
        }

        write!(request, "Content-Length: {}\r\n\r\n{}", body.len(), body).map_err(overflow)?;
        debug!("{} {}", method, path.as_str());

        Ok(request.into_bytes())
    }
}

impl Default for LegacyLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for LegacyLayer {
    fn init(&mut self, _cx: &mut Cx<'_>, config: &Config) -> LayerResult {
        self.api_key = config.api_key.clone();
        self.timeout_ms = config.network_timeout_ms;
        self.reply.clear();
        self.waiting = false;

        Ok(LayerState::Ok)
    }

    fn connect(&mut self, _cx: &mut Cx<'_>, endpoint: &Endpoint) -> LayerResult {
        self.host = endpoint.host.clone();
        Ok(LayerState::Ok)
    }

    fn data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
        let query = match data {
            Data::Query(query) => query,
            other => {
                error!("request stage cannot send {}", other.kind());
                return Err(crate::Error::UnexpectedData);
            }
        };

        if self.waiting {
            return Err(crate::Error::ProtocolViolation);
        }

        let request = self.request(&query)?;
        cx.forward_down(Data::Bytes(request))?;

        self.response = None;
        self.reply.clear();
        self.waiting = true;
        if self.timeout_ms != 0 {
            self.timer = Some(cx.schedule(self.timeout_ms, Wakeup::ResponseTimeout)?);
        }

        Ok(LayerState::Incomplete)
    }

    fn on_data_ready(&mut self, cx: &mut Cx<'_>, data: Data) -> LayerResult {
        match data {
            Data::Bytes(bytes) => {
                if !self.waiting {
                    warn!("{} unsolicited bytes ignored", bytes.len());
                    return Ok(LayerState::Ok);
                }

                self.reply
                    .extend_from_slice(&bytes)
                    .map_err(|_| crate::Error::BufferTooSmall)?;

                let Some(response) = parse_reply(&self.reply, false)? else {
                    return Ok(LayerState::Incomplete);
                };

                self.complete(cx, response);
                Ok(LayerState::Ok)
            }
            Data::None if self.waiting => Ok(LayerState::Incomplete),
            Data::None => Ok(LayerState::Ok),
            Data::Wakeup(Wakeup::ResponseTimeout) => {
                self.timer = None;
                if self.waiting {
                    error!("no response within {} ms", self.timeout_ms);
                    self.waiting = false;
                    return Err(crate::Error::TimedOut);
                }
                Ok(LayerState::Ok)
            }
            other => {
                error!("request stage cannot handle {}", other.kind());
                Err(crate::Error::UnexpectedData)
            }
        }
    }

    fn close(&mut self, cx: &mut Cx<'_>) -> LayerResult {
        if self.waiting && !self.reply.is_empty() {
            match parse_reply(&self.reply, true) {
                Ok(Some(response)) => self.complete(cx, response),
                Ok(None) => warn!("{} bytes of partial reply dropped", self.reply.len()),
                Err(e) => warn!("reply at close unreadable: {:?}", e),
            }
        }

        if let Some(timer) = self.timer.take() {
            cx.cancel(timer);
        }

        self.reply.clear();
        self.waiting = false;

        Ok(LayerState::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> LegacyLayer {
        let mut layer = LegacyLayer::new();
        layer.host = String::try_from("api.example.com").unwrap();
        layer.api_key = String::try_from("KEY123").unwrap();
        layer
    }

    fn text(frame: &Frame) -> &str {
        core::str::from_utf8(frame).unwrap()
    }

    #[test]
    fn datastream_update_request() {
        let datastream = Datastream::new(
            "temp",
            Datapoint::at("2014-01-01T00:00:00Z", Value::F32(21.5)).unwrap(),
        )
        .unwrap();
        let frame = layer()
            .request(&Query::DatastreamUpdate {
                feed_id: 42,
                datastream,
            })
            .unwrap();

        assert_eq!(
            text(&frame),
            "PUT /v2/feeds/42/datastreams/temp.csv HTTP/1.1\r\n\
             Host: api.example.com\r\n\
             User-Agent: layered-client/0.1.0\r\n\
             Accept: */*\r\n\
             X-ApiKey: KEY123\r\n\
             Content-Type: text/csv\r\n\
             Content-Length: 26\r\n\
             \r\n\
             2014-01-01T00:00:00Z,21.5\n"
        );
    }

    #[test]
    fn paths_per_query() {
        let id = || field("temp").unwrap();
        let cases = [
            (
                Query::FeedGet {
                    feed_id: 7,
                    datastreams: Vec::from_slice(&[id(), field("hum").unwrap()]).unwrap(),
                },
                "GET /v2/feeds/7.csv?datastreams=temp,hum ",
            ),
            (Query::FeedGetAll { feed_id: 7 }, "GET /v2/feeds/7.csv "),
            (
                Query::DatastreamGet {
                    feed_id: 7,
                    datastream_id: id(),
                },
                "GET /v2/feeds/7/datastreams/temp.csv ",
            ),
            (
                Query::DatastreamDelete {
                    feed_id: 7,
                    datastream_id: id(),
                },
                "DELETE /v2/feeds/7/datastreams/temp.csv ",
            ),
            (
                Query::DatapointDelete {
                    feed_id: 7,
                    datastream_id: id(),
                    timestamp: field("2014-01-01T00:00:00Z").unwrap(),
                },
                "DELETE /v2/feeds/7/datastreams/temp/datapoints/2014-01-01T00:00:00Z.csv ",
            ),
            (
                Query::DatapointDeleteRange {
                    feed_id: 7,
                    datastream_id: id(),
                    start: field("a").unwrap(),
                    end: field("b").unwrap(),
                },
                "DELETE /v2/feeds/7/datastreams/temp/datapoints.csv?start=a&end=b ",
            ),
        ];

        for (query, start) in cases {
            let frame = layer().request(&query).unwrap();
            assert!(text(&frame).starts_with(start), "{}", text(&frame));
            assert!(text(&frame).ends_with("Content-Length: 0\r\n\r\n"));
        }
    }

    #[test]
    fn feed_update_and_create_bodies() {
        let mut datastreams = Vec::new();
        datastreams
            .push(Datastream::new("temp", Datapoint::new(Value::I32(21))).unwrap())
            .unwrap();
        datastreams
            .push(Datastream::new("door", Datapoint::new(Value::Str(field("open").unwrap()))).unwrap())
            .unwrap();

        let frame = layer()
            .request(&Query::FeedUpdate {
                feed_id: 1,
                datastreams,
            })
            .unwrap();
        assert!(text(&frame).ends_with("\r\n\r\ntemp,21\ndoor,open\n"));

        let frame = layer()
            .request(&Query::DatastreamCreate {
                feed_id: 1,
                datastream: Datastream::new("temp", Datapoint::new(Value::I32(-3))).unwrap(),
            })
            .unwrap();
        assert!(text(&frame).starts_with("POST /v2/feeds/1/datastreams.csv "));
        assert!(text(&frame).ends_with("\r\n\r\ntemp,-3\n"));
    }

    #[test]
    fn reply_waits_for_content_length() {
        let reply = b"HTTP/1.1 200 OK\r\nContent-Type: text/csv\r\ncontent-length: 58\r\n\r\ntemp,2014-01-01T00:00:00Z,21\nhum,2014-01-01T00:00:00Z,0.5\n";
        let body_start = find(reply, b"\r\n\r\n").unwrap() + 4;
        assert_eq!(reply.len() - body_start, 58);

        for split in 0..reply.len() {
            assert_eq!(parse_reply(&reply[..split], false), Ok(None), "split {}", split);
        }

        let response = parse_reply(reply, false).unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.datastreams.len(), 2);
        assert_eq!(response.datastreams[0].id, "temp");
        assert_eq!(response.datastreams[0].datapoint.value, Value::I32(21));
        assert_eq!(response.datastreams[1].datapoint.value, Value::F32(0.5));
        assert_eq!(
            response.datastreams[1].datapoint.timestamp.as_deref(),
            Some("2014-01-01T00:00:00Z")
        );
    }

    #[test]
    fn datastream_row_without_id() {
        let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 24\r\n\r\n2014-01-01T00:00:00Z,on\n";

        let response = parse_reply(reply, false).unwrap().unwrap();
        assert_eq!(response.datastreams[0].id, "");
        assert_eq!(
            response.datastreams[0].datapoint.value,
            Value::Str(field("on").unwrap())
        );
    }

    #[test]
    fn error_status_skips_body() {
        let reply = b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found";

        let response = parse_reply(reply, false).unwrap().unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.is_success());
        assert!(response.datastreams.is_empty());
    }

    #[test]
    fn reply_without_length_ends_at_close() {
        let reply = b"HTTP/1.1 200 OK\r\nContent-Type: text/csv\r\n\r\n21\n";

        assert_eq!(parse_reply(reply, false), Ok(None));

        let response = parse_reply(reply, true).unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.datastreams.len(), 1);
        assert_eq!(response.datastreams[0].datapoint.value, Value::I32(21));

        let no_content = parse_reply(b"HTTP/1.1 204 No Content\r\n\r\n", false).unwrap();
        assert_eq!(no_content.map(|response| response.status), Some(204));
    }

    #[test]
    fn garbage_status_line() {
        assert_eq!(
            parse_reply(b"SMTP ready\r\n\r\n", false),
            Err(crate::Error::MalformedResponse)
        );
        assert_eq!(
            parse_reply(b"HTTP/1.1 abc\r\n\r\n", false),
            Err(crate::Error::MalformedResponse)
        );
    }

    #[test]
    fn value_parsing() {
        assert_eq!(Value::parse("42"), Ok(Value::I32(42)));
        assert_eq!(Value::parse("-1.25"), Ok(Value::F32(-1.25)));
        assert_eq!(Value::parse("nan"), Ok(Value::Str(field("nan").unwrap())));
        assert_eq!(Value::parse(""), Ok(Value::Str(Field::new())));
    }
}
