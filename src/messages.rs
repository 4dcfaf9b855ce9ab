use crate::address::{Addr, Host};
use crate::error::{Error, Result};
use crate::option_set::OptionSet;
use crate::protocol::{AuthReplyType, Command, RSV, ReplyCode, VERSION};
use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// read_version reads the leading version byte. Anything but 6 yields
/// VersionMismatch carrying the byte so the caller can answer older clients.
async fn read_version<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let version = reader.read_u8().await?;
    if version != VERSION {
        return Err(Error::VersionMismatch {
            version,
            consumed: vec![version],
        });
    }
    Ok(())
}

/// read_options reads an option block of `len` bytes
async fn read_options<R>(reader: &mut R, len: u16) -> Result<OptionSet>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = vec![0u8; len as usize];
    reader.read_exact(&mut raw).await?;
    OptionSet::parse(&mut raw.as_slice(), len as usize)
}

/// read_endpoint reads `port(u16) 0 atype addr`
async fn read_endpoint<R>(reader: &mut R) -> Result<Addr>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let port = reader.read_u16().await?;
    let _padding = reader.read_u8().await?;
    let atype = reader.read_u8().await?;
    let host = Host::read_address_from(reader, atype).await?;
    Ok(Addr { host, port })
}

fn write_endpoint(buf: &mut Vec<u8>, endpoint: &Addr) {
    buf.put_u16(endpoint.port);
    buf.put_u8(RSV);
    buf.put_u8(endpoint.address_type() as u8);
    endpoint.host.write_address(buf);
}

/// Request is the first message a client sends on a stream
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub command: Command,
    pub endpoint: Addr,
    pub options: OptionSet,
}

impl Request {
    pub fn new(command: Command, endpoint: Addr) -> Self {
        Self {
            command,
            endpoint,
            options: OptionSet::new(),
        }
    }

    // SOCKS6 request format
    // +-----+-----+---------+------+-----+------+----------+---------+
    // | VER | CMD | OPT LEN | PORT | PAD | ATYP | DST.ADDR | OPTIONS |
    // +-----+-----+---------+------+-----+------+----------+---------+
    // |  1  |  1  |    2    |  2   |  1  |  1   | Variable | OPT LEN |
    // +-----+-----+---------+------+-----+------+----------+---------+

    pub fn marshal(&self) -> Vec<u8> {
        let options = self.options.marshal();
        let mut buf = Vec::with_capacity(8 + self.endpoint.host.marshalled_len() + options.len());
        buf.put_u8(VERSION);
        buf.put_u8(self.command.as_byte());
        buf.put_u16(options.len() as u16);
        write_endpoint(&mut buf, &self.endpoint);
        buf.put_slice(options);
        buf
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        read_version(reader).await?;
        let command = Command::from_byte(reader.read_u8().await?);
        let options_len = reader.read_u16().await?;
        let endpoint = read_endpoint(reader).await?;
        let options = read_options(reader, options_len).await?;
        Ok(Self {
            command,
            endpoint,
            options,
        })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.marshal()).await?;
        Ok(())
    }
}

/// AuthenticationReply answers the authentication part of a request
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationReply {
    pub reply_type: AuthReplyType,
    pub options: OptionSet,
}

impl AuthenticationReply {
    pub fn new(reply_type: AuthReplyType, options: OptionSet) -> Self {
        Self {
            reply_type,
            options,
        }
    }

    pub fn success(&self) -> bool {
        self.reply_type == AuthReplyType::Success
    }

    // +-----+------+---------+---------+
    // | VER | TYPE | OPT LEN | OPTIONS |
    // +-----+------+---------+---------+
    // |  1  |  1   |    2    | OPT LEN |
    // +-----+------+---------+---------+

    pub fn marshal(&self) -> Vec<u8> {
        let options = self.options.marshal();
        let mut buf = Vec::with_capacity(4 + options.len());
        buf.put_u8(VERSION);
        buf.put_u8(self.reply_type as u8);
        buf.put_u16(options.len() as u16);
        buf.put_slice(options);
        buf
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        read_version(reader).await?;
        let raw = reader.read_u8().await?;
        let reply_type = AuthReplyType::from_byte(raw).ok_or(Error::EnumOutOfRange {
            field: "authentication reply type",
            value: raw as u32,
        })?;
        let options_len = reader.read_u16().await?;
        let options = read_options(reader, options_len).await?;
        Ok(Self {
            reply_type,
            options,
        })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.marshal()).await?;
        Ok(())
    }
}

/// OperationReply reports the outcome of the requested command
#[derive(Debug, Clone, PartialEq)]
pub struct OperationReply {
    pub code: ReplyCode,
    pub endpoint: Addr,
    pub options: OptionSet,
}

impl OperationReply {
    pub fn new(code: ReplyCode, endpoint: Addr) -> Self {
        Self {
            code,
            endpoint,
            options: OptionSet::new(),
        }
    }

    // +-----+------+---------+------+-----+------+----------+---------+
    // | VER | CODE | OPT LEN | PORT | PAD | ATYP | BND.ADDR | OPTIONS |
    // +-----+------+---------+------+-----+------+----------+---------+
    // |  1  |  1   |    2    |  2   |  1  |  1   | Variable | OPT LEN |
    // +-----+------+---------+------+-----+------+----------+---------+

    pub fn marshal(&self) -> Vec<u8> {
        let options = self.options.marshal();
        let mut buf = Vec::with_capacity(8 + self.endpoint.host.marshalled_len() + options.len());
        buf.put_u8(VERSION);
        buf.put_u8(self.code as u8);
        buf.put_u16(options.len() as u16);
        write_endpoint(&mut buf, &self.endpoint);
        buf.put_slice(options);
        buf
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        read_version(reader).await?;
        let raw = reader.read_u8().await?;
        let code = ReplyCode::from_byte(raw).ok_or(Error::EnumOutOfRange {
            field: "reply code",
            value: raw as u32,
        })?;
        let options_len = reader.read_u16().await?;
        let endpoint = read_endpoint(reader).await?;
        let options = read_options(reader, options_len).await?;
        Ok(Self {
            code,
            endpoint,
            options,
        })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.marshal()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionData;
    use crate::stack_options::{StackOption, StackOptionData};

    #[tokio::test]
    async fn noop_request_layout() {
        let request = Request::new(Command::Noop, Addr::unspecified());
        let wire = request.marshal();
        assert_eq!(wire, vec![6, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]);

        let parsed = Request::read_from(&mut wire.as_slice()).await.unwrap();
        assert_eq!(parsed, request);
    }

    #[tokio::test]
    async fn request_with_domain_and_options() {
        let mut request = Request::new(Command::Connect, Addr::new("example.com:443").unwrap());
        request.options.add_data(OptionData::SessionRequest);
        request
            .options
            .add(StackOption::new(true, false, StackOptionData::Tos(4)).into_option());

        let wire = request.marshal();
        let parsed = Request::read_from(&mut wire.as_slice()).await.unwrap();
        assert_eq!(parsed.command, Command::Connect);
        assert_eq!(parsed.endpoint, request.endpoint);
        assert_eq!(parsed.options.marshal(), request.options.marshal());
    }

    #[tokio::test]
    async fn version_mismatch_keeps_consumed_bytes() {
        let wire = [5u8, 1, 0];
        match Request::read_from(&mut &wire[..]).await {
            Err(Error::VersionMismatch { version, consumed }) => {
                assert_eq!(version, 5);
                assert_eq!(consumed, vec![5]);
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn padding_byte_is_ignored() {
        let wire = [6u8, 1, 0, 0, 0, 80, 0xff, 1, 10, 0, 0, 1];
        let parsed = Request::read_from(&mut &wire[..]).await.unwrap();
        assert_eq!(parsed.endpoint, Addr::new("10.0.0.1:80").unwrap());
    }

    #[tokio::test]
    async fn truncated_request_fails() {
        let wire = [6u8, 1, 0, 8, 0, 80, 0, 1, 10, 0, 0, 1, 0, 5];
        assert!(Request::read_from(&mut &wire[..]).await.is_err());
    }

    #[tokio::test]
    async fn replies_round_trip() {
        let mut options = OptionSet::new();
        options.add_data(OptionData::AuthMethodSelection(2));
        let auth = AuthenticationReply::new(AuthReplyType::Failure, options);
        let wire = auth.marshal();
        assert_eq!(&wire[..4], &[6, 1, 0, 8]);
        assert_eq!(AuthenticationReply::read_from(&mut wire.as_slice()).await.unwrap(), auth);

        let op = OperationReply::new(ReplyCode::Timeout, Addr::new("[::1]:8080").unwrap());
        let wire = op.marshal();
        assert_eq!(OperationReply::read_from(&mut wire.as_slice()).await.unwrap(), op);
    }

    #[tokio::test]
    async fn unknown_reply_code_is_rejected() {
        let wire = [6u8, 42, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0];
        assert!(matches!(
            OperationReply::read_from(&mut &wire[..]).await,
            Err(Error::EnumOutOfRange { .. })
        ));
    }
}
