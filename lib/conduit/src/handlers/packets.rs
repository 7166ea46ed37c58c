//! Setup packet layouts for the three connection protocols. All integers are
//! big-endian; variable-length fields carry a `u16` length prefix except
//! where a packet consumes the remainder of its message.

use crate::net::support::{
    CommandId, Deserialize, ErrorType, NetworkError, NetworkResult, Serialize, SizedRead,
    SizedWrite, TransientConnectionId,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use solder::crypto::{CipherMode, PbkdfVariant, SymmetricCipher};
use solder::device::{DeviceId, DeviceIpSettings, PeerRole};
use solder::session::SessionId;
use std::io::{Cursor, Read, Write};

#[inline]
fn fail<T>() -> NetworkResult<T> {
    Err(NetworkError::Fatal(ErrorType::Serialization))
}

fn write_bytes<W: SizedWrite>(stream: &mut W, data: &[u8]) -> NetworkResult<()> {
    if data.len() > usize::from(u16::max_value()) {
        return fail();
    }

    stream.write_u16::<BigEndian>(data.len() as u16)?;
    stream.write_all(data)?;
    Ok(())
}

fn read_bytes<R: SizedRead>(stream: &mut R) -> NetworkResult<Vec<u8>> {
    if stream.remaining_data() < 2 {
        return fail();
    }

    let size = stream.read_u16::<BigEndian>()? as usize;

    if stream.remaining_data() < size {
        return fail();
    }

    let mut data = vec![0u8; size];
    stream.read_exact(&mut data)?;
    Ok(data)
}

fn write_device_id<W: SizedWrite>(stream: &mut W, id: &DeviceId) -> NetworkResult<()> {
    stream.write_all(id.as_bytes())?;
    Ok(())
}

fn read_device_id<R: SizedRead>(stream: &mut R) -> NetworkResult<DeviceId> {
    if stream.remaining_data() < DeviceId::SIZE {
        return fail();
    }

    let mut raw = [0u8; DeviceId::SIZE];
    stream.read_exact(&mut raw)?;
    Ok(DeviceId::new(raw))
}

fn write_ip_settings<W: SizedWrite>(stream: &mut W, settings: &DeviceIpSettings) -> NetworkResult<()> {
    write_bytes(stream, settings.command_address.as_bytes())?;
    stream.write_u16::<BigEndian>(settings.command_port)?;
    write_bytes(stream, settings.data_address.as_bytes())?;
    stream.write_u16::<BigEndian>(settings.data_port)?;
    write_bytes(stream, settings.init_address.as_bytes())?;
    stream.write_u16::<BigEndian>(settings.init_port)?;
    Ok(())
}

fn read_string<R: SizedRead>(stream: &mut R) -> NetworkResult<String> {
    String::from_utf8(read_bytes(stream)?).or_else(|_| fail())
}

fn read_ip_settings<R: SizedRead>(stream: &mut R) -> NetworkResult<DeviceIpSettings> {
    let command_address = read_string(stream)?;
    if stream.remaining_data() < 2 {
        return fail();
    }
    let command_port = stream.read_u16::<BigEndian>()?;

    let data_address = read_string(stream)?;
    if stream.remaining_data() < 2 {
        return fail();
    }
    let data_port = stream.read_u16::<BigEndian>()?;

    let init_address = read_string(stream)?;
    if stream.remaining_data() < 2 {
        return fail();
    }
    let init_port = stream.read_u16::<BigEndian>()?;

    Ok(DeviceIpSettings {
        command_address,
        command_port,
        data_address,
        data_port,
        init_address,
        init_port,
    })
}

fn read_remainder<R: SizedRead>(stream: &mut R) -> NetworkResult<Vec<u8>> {
    let mut data = vec![0u8; stream.remaining_data()];
    stream.read_exact(&mut data)?;
    Ok(data)
}

/// Serializes a packet into a fresh byte vector.
pub fn to_vec<P: Serialize>(packet: &P) -> NetworkResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    packet.serialize(&mut cursor)?;
    Ok(cursor.into_inner())
}

/// Deserializes a packet from a message payload.
pub fn from_slice<P: Deserialize>(data: &[u8]) -> NetworkResult<P> {
    let mut cursor = Cursor::new(data);
    P::deserialize(&mut cursor)
}

/// INIT message 1: the transient id and key-derivation parameters in
/// plaintext (the responder needs them to locate its pending configuration
/// and derive the key), followed by the sealed request secret. The sealed
/// part repeats the transient id so it is bound to the derived key.
#[derive(Debug, Eq, PartialEq)]
pub struct InitSetupRequest {
    pub transient_id: TransientConnectionId,
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub pbkdf: PbkdfVariant,
    pub cipher: SymmetricCipher,
    pub mode: CipherMode,
    pub sealed: Vec<u8>,
}

impl Serialize for InitSetupRequest {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u32::<BigEndian>(self.transient_id)?;
        write_bytes(stream, &self.salt)?;
        stream.write_u32::<BigEndian>(self.iterations)?;
        stream.write_u8(self.pbkdf.code())?;
        stream.write_u8(self.cipher.code())?;
        stream.write_u8(self.mode.code())?;
        stream.write_all(&self.sealed)?;
        Ok(())
    }
}

impl Deserialize for InitSetupRequest {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<InitSetupRequest> {
        if stream.remaining_data() < 4 {
            return fail();
        }
        let transient_id = stream.read_u32::<BigEndian>()?;

        let salt = read_bytes(stream)?;

        if stream.remaining_data() < 7 {
            return fail();
        }

        let iterations = stream.read_u32::<BigEndian>()?;
        let pbkdf = PbkdfVariant::from_code(stream.read_u8()?).ok_or(NetworkError::Fatal(ErrorType::Serialization))?;
        let cipher =
            SymmetricCipher::from_code(stream.read_u8()?).ok_or(NetworkError::Fatal(ErrorType::Serialization))?;
        let mode = CipherMode::from_code(stream.read_u8()?).ok_or(NetworkError::Fatal(ErrorType::Serialization))?;
        let sealed = read_remainder(stream)?;

        Ok(InitSetupRequest {
            transient_id,
            salt,
            iterations,
            pbkdf,
            cipher,
            mode,
            sealed,
        })
    }
}

/// Sealed part of INIT message 1.
#[derive(Debug, Eq, PartialEq)]
pub struct InitRequestSecret {
    pub nonce: Vec<u8>,
    pub transient_id: TransientConnectionId,
    pub peer_role: PeerRole,
}

impl Serialize for InitRequestSecret {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        write_bytes(stream, &self.nonce)?;
        stream.write_u32::<BigEndian>(self.transient_id)?;
        stream.write_u8(self.peer_role.code())?;
        Ok(())
    }
}

impl Deserialize for InitRequestSecret {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<InitRequestSecret> {
        let nonce = read_bytes(stream)?;

        if stream.remaining_data() < 5 {
            return fail();
        }

        let transient_id = stream.read_u32::<BigEndian>()?;
        let peer_role = PeerRole::from_code(stream.read_u8()?).ok_or(NetworkError::Fatal(ErrorType::Serialization))?;

        Ok(InitRequestSecret {
            nonce,
            transient_id,
            peer_role,
        })
    }
}

/// Sealed INIT message 2: echoes the initiator's nonce, carries the
/// responder's identity and a fresh nonce for the confirmation.
#[derive(Debug, Eq, PartialEq)]
pub struct InitResponseSecret {
    pub nonce_echo: Vec<u8>,
    pub nonce: Vec<u8>,
    pub device_id: DeviceId,
    pub public_key: Vec<u8>,
    pub ip_settings: DeviceIpSettings,
    pub peer_role: PeerRole,
}

impl Serialize for InitResponseSecret {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        write_bytes(stream, &self.nonce_echo)?;
        write_bytes(stream, &self.nonce)?;
        write_device_id(stream, &self.device_id)?;
        write_bytes(stream, &self.public_key)?;
        write_ip_settings(stream, &self.ip_settings)?;
        stream.write_u8(self.peer_role.code())?;
        Ok(())
    }
}

impl Deserialize for InitResponseSecret {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<InitResponseSecret> {
        let nonce_echo = read_bytes(stream)?;
        let nonce = read_bytes(stream)?;
        let device_id = read_device_id(stream)?;
        let public_key = read_bytes(stream)?;
        let ip_settings = read_ip_settings(stream)?;

        if stream.remaining_data() < 1 {
            return fail();
        }
        let peer_role = PeerRole::from_code(stream.read_u8()?).ok_or(NetworkError::Fatal(ErrorType::Serialization))?;

        Ok(InitResponseSecret {
            nonce_echo,
            nonce,
            device_id,
            public_key,
            ip_settings,
            peer_role,
        })
    }
}

/// Sealed INIT message 3: echoes the responder's nonce and carries the
/// initiator's identity. When the responder is a server, the freshly
/// generated authentication password travels here.
#[derive(Debug, Eq, PartialEq)]
pub struct InitConfirmSecret {
    pub nonce_echo: Vec<u8>,
    pub device_id: DeviceId,
    pub public_key: Vec<u8>,
    pub ip_settings: DeviceIpSettings,
    pub server_password: Option<String>,
}

impl Serialize for InitConfirmSecret {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        write_bytes(stream, &self.nonce_echo)?;
        write_device_id(stream, &self.device_id)?;
        write_bytes(stream, &self.public_key)?;
        write_ip_settings(stream, &self.ip_settings)?;

        match &self.server_password {
            Some(password) => {
                stream.write_u8(1)?;
                write_bytes(stream, password.as_bytes())?;
            }
            None => stream.write_u8(0)?,
        }

        Ok(())
    }
}

impl Deserialize for InitConfirmSecret {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<InitConfirmSecret> {
        let nonce_echo = read_bytes(stream)?;
        let device_id = read_device_id(stream)?;
        let public_key = read_bytes(stream)?;
        let ip_settings = read_ip_settings(stream)?;

        if stream.remaining_data() < 1 {
            return fail();
        }

        let server_password = match stream.read_u8()? {
            0 => None,
            1 => Some(read_string(stream)?),
            _ => return fail(),
        };

        Ok(InitConfirmSecret {
            nonce_echo,
            device_id,
            public_key,
            ip_settings,
            server_password,
        })
    }
}

/// COMMAND message 1 envelope: the sender's id in plaintext (for record
/// lookup), the asymmetrically encrypted secret and its signature.
#[derive(Debug, Eq, PartialEq)]
pub struct CommandSetupRequest {
    pub peer_id: DeviceId,
    pub encrypted: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Serialize for CommandSetupRequest {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        write_device_id(stream, &self.peer_id)?;
        stream.write_u32::<BigEndian>(self.encrypted.len() as u32)?;
        stream.write_all(&self.encrypted)?;
        stream.write_u32::<BigEndian>(self.signature.len() as u32)?;
        stream.write_all(&self.signature)?;
        Ok(())
    }
}

impl Deserialize for CommandSetupRequest {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<CommandSetupRequest> {
        let peer_id = read_device_id(stream)?;

        if stream.remaining_data() < 4 {
            return fail();
        }
        let encrypted_size = stream.read_u32::<BigEndian>()? as usize;
        if stream.remaining_data() < encrypted_size {
            return fail();
        }
        let mut encrypted = vec![0u8; encrypted_size];
        stream.read_exact(&mut encrypted)?;

        if stream.remaining_data() < 4 {
            return fail();
        }
        let signature_size = stream.read_u32::<BigEndian>()? as usize;
        if stream.remaining_data() < signature_size {
            return fail();
        }
        let mut signature = vec![0u8; signature_size];
        stream.read_exact(&mut signature)?;

        Ok(CommandSetupRequest {
            peer_id,
            encrypted,
            signature,
        })
    }
}

/// Asymmetrically encrypted part of COMMAND message 1. `key_material` is the
/// session key in RSA mode or the initiator's agreement public key in ECDH
/// mode.
#[derive(Debug, Eq, PartialEq)]
pub struct CommandRequestSecret {
    pub peer_id: DeviceId,
    pub nonce: Vec<u8>,
    pub key_material: Vec<u8>,
    pub iv: Vec<u8>,
    pub cipher: SymmetricCipher,
    pub mode: CipherMode,
}

impl Serialize for CommandRequestSecret {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        write_device_id(stream, &self.peer_id)?;
        write_bytes(stream, &self.nonce)?;
        write_bytes(stream, &self.key_material)?;
        write_bytes(stream, &self.iv)?;
        stream.write_u8(self.cipher.code())?;
        stream.write_u8(self.mode.code())?;
        Ok(())
    }
}

impl Deserialize for CommandRequestSecret {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<CommandRequestSecret> {
        let peer_id = read_device_id(stream)?;
        let nonce = read_bytes(stream)?;
        let key_material = read_bytes(stream)?;
        let iv = read_bytes(stream)?;

        if stream.remaining_data() < 2 {
            return fail();
        }
        let cipher =
            SymmetricCipher::from_code(stream.read_u8()?).ok_or(NetworkError::Fatal(ErrorType::Serialization))?;
        let mode = CipherMode::from_code(stream.read_u8()?).ok_or(NetworkError::Fatal(ErrorType::Serialization))?;

        Ok(CommandRequestSecret {
            peer_id,
            nonce,
            key_material,
            iv,
            cipher,
            mode,
        })
    }
}

/// Sealed COMMAND message 2: the nonce echo, the session verdict and the
/// issued session id.
#[derive(Debug, Eq, PartialEq)]
pub struct CommandSetupResponse {
    pub nonce_echo: Vec<u8>,
    pub ok: bool,
    pub session: SessionId,
}

impl Serialize for CommandSetupResponse {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        write_bytes(stream, &self.nonce_echo)?;
        stream.write_u8(if self.ok { 1 } else { 0 })?;
        stream.write_u64::<BigEndian>(self.session)?;
        Ok(())
    }
}

impl Deserialize for CommandSetupResponse {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<CommandSetupResponse> {
        let nonce_echo = read_bytes(stream)?;

        if stream.remaining_data() < 9 {
            return fail();
        }

        let ok = match stream.read_u8()? {
            0 => false,
            1 => true,
            _ => return fail(),
        };
        let session = stream.read_u64::<BigEndian>()?;

        Ok(CommandSetupResponse {
            nonce_echo,
            ok,
            session,
        })
    }
}

/// DATA message 1 envelope: routing ids in plaintext, the sealed secret and
/// its signature.
#[derive(Debug, Eq, PartialEq)]
pub struct DataSetupRequest {
    pub device_id: DeviceId,
    pub transient_id: TransientConnectionId,
    pub encrypted: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Serialize for DataSetupRequest {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        write_device_id(stream, &self.device_id)?;
        stream.write_u32::<BigEndian>(self.transient_id)?;
        stream.write_u32::<BigEndian>(self.encrypted.len() as u32)?;
        stream.write_all(&self.encrypted)?;
        stream.write_u32::<BigEndian>(self.signature.len() as u32)?;
        stream.write_all(&self.signature)?;
        Ok(())
    }
}

impl Deserialize for DataSetupRequest {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<DataSetupRequest> {
        let device_id = read_device_id(stream)?;

        if stream.remaining_data() < 8 {
            return fail();
        }
        let transient_id = stream.read_u32::<BigEndian>()?;

        let encrypted_size = stream.read_u32::<BigEndian>()? as usize;
        if stream.remaining_data() < encrypted_size {
            return fail();
        }
        let mut encrypted = vec![0u8; encrypted_size];
        stream.read_exact(&mut encrypted)?;

        if stream.remaining_data() < 4 {
            return fail();
        }
        let signature_size = stream.read_u32::<BigEndian>()? as usize;
        if stream.remaining_data() < signature_size {
            return fail();
        }
        let mut signature = vec![0u8; signature_size];
        stream.read_exact(&mut signature)?;

        Ok(DataSetupRequest {
            device_id,
            transient_id,
            encrypted,
            signature,
        })
    }
}

/// Sealed part of DATA message 1.
#[derive(Debug, Eq, PartialEq)]
pub struct DataRequestSecret {
    pub nonce: Vec<u8>,
    pub transient_id: TransientConnectionId,
}

impl Serialize for DataRequestSecret {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        write_bytes(stream, &self.nonce)?;
        stream.write_u32::<BigEndian>(self.transient_id)?;
        Ok(())
    }
}

impl Deserialize for DataRequestSecret {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<DataRequestSecret> {
        let nonce = read_bytes(stream)?;

        if stream.remaining_data() < 4 {
            return fail();
        }
        let transient_id = stream.read_u32::<BigEndian>()?;

        Ok(DataRequestSecret { nonce, transient_id })
    }
}

/// Sealed DATA message 2: the nonce echo and the setup verdict.
#[derive(Debug, Eq, PartialEq)]
pub struct DataSetupResponse {
    pub nonce_echo: Vec<u8>,
    pub ok: bool,
}

impl Serialize for DataSetupResponse {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        write_bytes(stream, &self.nonce_echo)?;
        stream.write_u8(if self.ok { 1 } else { 0 })?;
        Ok(())
    }
}

impl Deserialize for DataSetupResponse {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<DataSetupResponse> {
        let nonce_echo = read_bytes(stream)?;

        if stream.remaining_data() < 1 {
            return fail();
        }

        let ok = match stream.read_u8()? {
            0 => false,
            1 => true,
            _ => return fail(),
        };

        Ok(DataSetupResponse { nonce_echo, ok })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EnvelopeKind {
    Request,
    Response,
}

/// Steady-state COMMAND plaintext: an instruction with a correlation id.
/// Responses echo the id of the request they answer.
#[derive(Debug, Eq, PartialEq)]
pub struct InstructionEnvelope {
    pub command_id: CommandId,
    pub kind: EnvelopeKind,
    pub payload: Vec<u8>,
}

impl Serialize for InstructionEnvelope {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u32::<BigEndian>(self.command_id)?;
        stream.write_u8(match self.kind {
            EnvelopeKind::Request => 0,
            EnvelopeKind::Response => 1,
        })?;
        stream.write_all(&self.payload)?;
        Ok(())
    }
}

impl Deserialize for InstructionEnvelope {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<InstructionEnvelope> {
        if stream.remaining_data() < 5 {
            return fail();
        }

        let command_id = stream.read_u32::<BigEndian>()?;
        let kind = match stream.read_u8()? {
            0 => EnvelopeKind::Request,
            1 => EnvelopeKind::Response,
            _ => return fail(),
        };
        let payload = read_remainder(stream)?;

        Ok(InstructionEnvelope {
            command_id,
            kind,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip_settings() -> DeviceIpSettings {
        DeviceIpSettings {
            command_address: "192.168.0.1".to_string(),
            command_port: 9001,
            data_address: "192.168.0.1".to_string(),
            data_port: 9002,
            init_address: "192.168.0.1".to_string(),
            init_port: 9003,
        }
    }

    #[test]
    fn test_init_request_roundtrip() {
        let packet = InitSetupRequest {
            transient_id: 42,
            salt: vec![1u8; 16],
            iterations: 10_000,
            pbkdf: PbkdfVariant::Sha256,
            cipher: SymmetricCipher::Aes,
            mode: CipherMode::Gcm,
            sealed: vec![9, 8, 7, 6],
        };

        let bytes = to_vec(&packet).unwrap();
        assert_eq!(from_slice::<InitSetupRequest>(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_init_request_secret_roundtrip() {
        let packet = InitRequestSecret {
            nonce: vec![5u8; 32],
            transient_id: 42,
            peer_role: PeerRole::Client,
        };

        let bytes = to_vec(&packet).unwrap();
        assert_eq!(from_slice::<InitRequestSecret>(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_init_response_secret_roundtrip() {
        let packet = InitResponseSecret {
            nonce_echo: vec![5u8; 32],
            nonce: vec![6u8; 32],
            device_id: DeviceId::new([3; 16]),
            public_key: vec![1, 2, 3, 4],
            ip_settings: ip_settings(),
            peer_role: PeerRole::Server,
        };

        let bytes = to_vec(&packet).unwrap();
        assert_eq!(from_slice::<InitResponseSecret>(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_init_confirm_password_variants() {
        let with_password = InitConfirmSecret {
            nonce_echo: vec![6u8; 32],
            device_id: DeviceId::new([4; 16]),
            public_key: vec![1, 2, 3],
            ip_settings: ip_settings(),
            server_password: Some("generated".to_string()),
        };

        let bytes = to_vec(&with_password).unwrap();
        assert_eq!(from_slice::<InitConfirmSecret>(&bytes).unwrap(), with_password);

        let without_password = InitConfirmSecret {
            server_password: None,
            ..with_password
        };

        let bytes = to_vec(&without_password).unwrap();
        assert_eq!(from_slice::<InitConfirmSecret>(&bytes).unwrap(), without_password);
    }

    #[test]
    fn test_command_request_roundtrip() {
        let packet = CommandSetupRequest {
            peer_id: DeviceId::new([7; 16]),
            encrypted: vec![1u8; 64],
            signature: vec![2u8; 8],
        };

        let bytes = to_vec(&packet).unwrap();
        assert_eq!(from_slice::<CommandSetupRequest>(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_command_secret_roundtrip() {
        let packet = CommandRequestSecret {
            peer_id: DeviceId::new([7; 16]),
            nonce: vec![3u8; 32],
            key_material: vec![4u8; 32],
            iv: vec![5u8; 12],
            cipher: SymmetricCipher::Twofish,
            mode: CipherMode::Eax,
        };

        let bytes = to_vec(&packet).unwrap();
        assert_eq!(from_slice::<CommandRequestSecret>(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_command_response_roundtrip() {
        let packet = CommandSetupResponse {
            nonce_echo: vec![3u8; 32],
            ok: true,
            session: 12345,
        };

        let bytes = to_vec(&packet).unwrap();
        assert_eq!(from_slice::<CommandSetupResponse>(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_data_packets_roundtrip() {
        let request = DataSetupRequest {
            device_id: DeviceId::new([8; 16]),
            transient_id: 77,
            encrypted: vec![1u8; 48],
            signature: vec![2u8; 8],
        };
        let bytes = to_vec(&request).unwrap();
        assert_eq!(from_slice::<DataSetupRequest>(&bytes).unwrap(), request);

        let secret = DataRequestSecret {
            nonce: vec![9u8; 32],
            transient_id: 77,
        };
        let bytes = to_vec(&secret).unwrap();
        assert_eq!(from_slice::<DataRequestSecret>(&bytes).unwrap(), secret);

        let response = DataSetupResponse {
            nonce_echo: vec![9u8; 32],
            ok: false,
        };
        let bytes = to_vec(&response).unwrap();
        assert_eq!(from_slice::<DataSetupResponse>(&bytes).unwrap(), response);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let request = InstructionEnvelope {
            command_id: 9,
            kind: EnvelopeKind::Request,
            payload: b"list-files".to_vec(),
        };
        let bytes = to_vec(&request).unwrap();
        assert_eq!(from_slice::<InstructionEnvelope>(&bytes).unwrap(), request);

        let response = InstructionEnvelope {
            command_id: 9,
            kind: EnvelopeKind::Response,
            payload: b"ok".to_vec(),
        };
        let bytes = to_vec(&response).unwrap();
        assert_eq!(from_slice::<InstructionEnvelope>(&bytes).unwrap(), response);
    }

    #[test]
    fn test_truncated_packets_rejected() {
        let packet = InitResponseSecret {
            nonce_echo: vec![5u8; 32],
            nonce: vec![6u8; 32],
            device_id: DeviceId::new([3; 16]),
            public_key: vec![1, 2, 3, 4],
            ip_settings: ip_settings(),
            peer_role: PeerRole::Server,
        };

        let bytes = to_vec(&packet).unwrap();

        for cut in &[0usize, 1, 10, bytes.len() - 1] {
            assert!(from_slice::<InitResponseSecret>(&bytes[..*cut]).is_err());
        }
    }

    #[test]
    fn test_unknown_codes_rejected() {
        let packet = InitRequestSecret {
            nonce: vec![5u8; 4],
            transient_id: 1,
            peer_role: PeerRole::Client,
        };

        let mut bytes = to_vec(&packet).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = b'X';

        assert!(from_slice::<InitRequestSecret>(&bytes).is_err());
    }
}
