use embedded_io_async::{Error as _, Read, Write};
use embedded_time::Clock;

use crate::{
    context::Context,
    layer::{LayerResult, LayerState},
    transport::Channel,
};

pub async fn flush<S, C, const H: usize>(
    ctx: &mut Context<Channel, C, H>,
    stream: &mut S,
) -> Result<(), crate::Error>
where
    S: Write,
    C: Clock<T = u64>,
{
    let channel = ctx.transport().ok_or(crate::Error::NoSuchLayer)?;
    let pending = channel.outgoing();
    if pending.is_empty() {
        return Ok(());
    }

    let len = pending.len();
    stream.write_all(pending).await.map_err(|_| {
        warn!("write of {} bytes failed", len);
        crate::Error::TransportError
    })?;
    stream.flush().await.map_err(|e| {
        warn!("flush failed: {:?}", e.kind());
        crate::Error::TransportError
    })?;
    trace!("wrote {} bytes", len);

    if let Some(channel) = ctx.transport_mut() {
        channel.consume(len);
    }

    Ok(())
}

/// A read of zero bytes tears the chain down with `RemoteClosed`.
pub async fn pump<S, C, const H: usize>(
    ctx: &mut Context<Channel, C, H>,
    stream: &mut S,
    buf: &mut [u8],
) -> LayerResult
where
    S: Read + Write,
    C: Clock<T = u64>,
{
    flush(ctx, stream).await?;

    let n = stream.read(buf).await.map_err(|e| {
        warn!("read failed: {:?}", e.kind());
        crate::Error::TransportError
    })?;

    if n == 0 {
        info!("link closed by peer");
        ctx.disconnect();
        return Err(crate::Error::RemoteClosed);
    }

    let mut state = LayerState::Ok;
    if ctx.transport().is_some_and(Channel::is_open) {
        state = ctx.receive(&buf[..n])?;
        state = state.merge(ctx.poll()?);
    } else {
        debug!("{} bytes after close dropped", n);
    }

    flush(ctx, stream).await?;
    Ok(state)
}
