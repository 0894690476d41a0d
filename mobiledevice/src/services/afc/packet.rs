use tracing::{debug, trace};

use crate::{DeviceError, ServiceConnection};

use super::opcode::AfcOpcode;

#[derive(Clone, Debug)]
pub struct AfcPacketHeader {
    pub magic: u64,
    pub entire_len: u64,
    pub header_payload_len: u64,
    pub packet_num: u64,
    pub operation: AfcOpcode,
}

#[derive(Clone, Debug)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

fn le_u64(bytes: &[u8]) -> Result<u64, DeviceError> {
    bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| DeviceError::ProtocolError("short afc field".into()))
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;
    /// Largest packet accepted from afcd, header included
    pub const MAX_PACKET_LEN: u64 = 16 * 1024 * 1024;

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(Self::LEN as usize);

        res.extend_from_slice(&self.magic.to_le_bytes());
        res.extend_from_slice(&self.entire_len.to_le_bytes());
        res.extend_from_slice(&self.header_payload_len.to_le_bytes());
        res.extend_from_slice(&self.packet_num.to_le_bytes());
        res.extend_from_slice(&(self.operation as u64).to_le_bytes());

        res
    }

    pub async fn read(reader: &mut ServiceConnection) -> Result<Self, DeviceError> {
        let bytes = reader.read_raw(Self::LEN as usize).await?;
        let field = |i: usize| le_u64(&bytes[i * 8..]);

        let magic = field(0)?;
        if magic != super::MAGIC {
            return Err(DeviceError::ProtocolError(format!(
                "bad afc magic {magic:#x}"
            )));
        }
        let opcode = field(4)?;
        let res = Self {
            magic,
            entire_len: field(1)?,
            header_payload_len: field(2)?,
            packet_num: field(3)?,
            operation: AfcOpcode::try_from(opcode).map_err(|_| {
                DeviceError::ProtocolError(format!("unknown afc opcode {opcode:#x}"))
            })?,
        };
        if res.header_payload_len < Self::LEN || res.entire_len < res.header_payload_len {
            return Err(DeviceError::ProtocolError(
                "inconsistent afc packet lengths".into(),
            ));
        }
        if res.entire_len > Self::MAX_PACKET_LEN {
            return Err(DeviceError::ProtocolError(format!(
                "afc packet of {} bytes exceeds the {} byte limit",
                res.entire_len,
                Self::MAX_PACKET_LEN
            )));
        }
        Ok(res)
    }
}

impl AfcPacket {
    /// Builds a packet, filling in the magic and both lengths
    pub fn new(
        operation: AfcOpcode,
        packet_num: u64,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Self {
        let header_payload_len = header_payload.len() as u64 + AfcPacketHeader::LEN;
        Self {
            header: AfcPacketHeader {
                magic: super::MAGIC,
                entire_len: header_payload_len + payload.len() as u64,
                header_payload_len,
                packet_num,
                operation,
            },
            header_payload,
            payload,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(self.header.entire_len as usize);

        res.extend_from_slice(&self.header.serialize());
        res.extend_from_slice(&self.header_payload);
        res.extend_from_slice(&self.payload);

        res
    }

    /// First eight bytes of the header payload as a little endian integer
    pub fn header_u64(&self) -> Result<u64, DeviceError> {
        le_u64(&self.header_payload)
    }

    /// Splits the payload into its NUL separated strings
    pub fn payload_strings(&self) -> Vec<String> {
        self.payload
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }

    pub async fn write(&self, writer: &mut ServiceConnection) -> Result<(), DeviceError> {
        trace!("Send afc: {:?}", self.header);
        writer.send_raw(&self.serialize()).await
    }

    pub async fn read(reader: &mut ServiceConnection) -> Result<Self, DeviceError> {
        let header = AfcPacketHeader::read(reader).await?;
        debug!("afc header: {header:?}");
        let header_payload = reader
            .read_raw((header.header_payload_len - AfcPacketHeader::LEN) as usize)
            .await?;

        let payload = if header.header_payload_len == header.entire_len {
            Vec::new()
        } else {
            reader
                .read_raw((header.entire_len - header.header_payload_len) as usize)
                .await?
        };

        Ok(Self {
            header,
            header_payload,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let packet = AfcPacket::new(AfcOpcode::ReadDir, 7, b"/DCIM".to_vec(), Vec::new());
        let bytes = packet.serialize();
        assert_eq!(bytes.len(), 45);
        assert_eq!(&bytes[..8], b"CFA6LPAA");
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 45);
        assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 7);
        assert_eq!(u64::from_le_bytes(bytes[32..40].try_into().unwrap()), 3);
        assert_eq!(&bytes[40..], b"/DCIM");
    }

    #[tokio::test]
    async fn absurd_lengths_are_a_protocol_error() {
        let (a, b) = tokio::io::duplex(256);
        let mut sender = ServiceConnection::new(Box::new(a), "t");
        let mut receiver = ServiceConnection::new(Box::new(b), "t");

        let mut header = AfcPacket::new(AfcOpcode::Data, 0, Vec::new(), Vec::new()).header;
        header.entire_len = u64::MAX;
        sender.send_raw(&header.serialize()).await.unwrap();

        assert!(matches!(
            AfcPacket::read(&mut receiver).await,
            Err(DeviceError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn bad_magic_is_a_protocol_error() {
        let (a, b) = tokio::io::duplex(256);
        let mut sender = ServiceConnection::new(Box::new(a), "t");
        let mut receiver = ServiceConnection::new(Box::new(b), "t");
        sender.send_raw(&[0u8; 40]).await.unwrap();
        assert!(matches!(
            AfcPacket::read(&mut receiver).await,
            Err(DeviceError::ProtocolError(_))
        ));
    }
}
