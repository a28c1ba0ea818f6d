use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_payload(buf: &mut impl BufMut, payload: &[u8]) {
    buf.put_usize_varint(payload.len());
    buf.put_slice(payload);
}

pub fn try_get_payload(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if len > buf.remaining() {
        bail!("payload length {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => bail!("invalid value for a boolean: {}", b),
    }
}
