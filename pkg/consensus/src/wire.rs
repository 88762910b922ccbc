use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::*;
use crate::protos::*;

/*
	Every consensus message is a single channel message: a fixed one byte tag followed by
	little-endian fields in declaration order. An AppendEntries header is followed on the
	same channel message by (idx - prev_index) entry frames; entry indices are implied
	contiguous from prev_index + 1 and do not travel on the wire.

	The entry frame here is byte-identical to the frame the ledger file uses, so a ledger
	range can be spliced into an outgoing message without re-encoding.
*/

pub const TAG_APPEND_ENTRIES: u8 = 1;
pub const TAG_APPEND_ENTRIES_RESPONSE: u8 = 2;
pub const TAG_REQUEST_VOTE: u8 = 3;
pub const TAG_REQUEST_VOTE_RESPONSE: u8 = 4;
pub const TAG_PROPOSE_REQUEST_VOTE: u8 = 5;

const RESULT_OK: u8 = 0;
const RESULT_CONFLICT: u8 = 1;

/// Decode-side sanity bound on the number of entries in one AppendEntries
const MAX_ENTRIES_PER_MESSAGE: u64 = 4096;

/// Decode-side sanity bound on a single entry payload
const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Serializes an engine-authored payload blob (membership sets, retirement lists,
/// state machine commands in the demo binary)
pub fn marshal<T: Serialize>(value: &T) -> Result<Vec<u8>> {
	Ok(rmp_serde::to_vec_named(value)?)
}

pub fn unmarshal<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
	Ok(rmp_serde::from_slice(data)?)
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
	out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
	out.extend_from_slice(&v.to_le_bytes());
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
	out.extend_from_slice(&v.to_le_bytes());
}

fn put_node_id(out: &mut Vec<u8>, id: &NodeId) {
	let s = id.as_str().as_bytes();
	// Ids are short operator-assigned strings; anything near this limit is a bug upstream
	assert!(s.len() <= u16::MAX as usize);
	put_u16(out, s.len() as u16);
	out.extend_from_slice(s);
}

fn read_node_id(c: &mut Cursor<&[u8]>) -> Result<NodeId> {
	let len = c.read_u16::<LittleEndian>()? as usize;
	let mut buf = vec![0u8; len];
	c.read_exact(&mut buf)?;

	let s = String::from_utf8(buf)
		.map_err(|_| Error::from(ErrorKind::Malformed("node id is not utf-8".into())))?;

	Ok(NodeId::new(s))
}

/// Appends the frame of a single entry: { length: u32, term: u64, committable: u8,
/// kind: u8, payload }. Shared between the wire format and the ledger file layout.
pub fn put_entry_frame(out: &mut Vec<u8>, entry: &LogEntry) {
	assert!(entry.payload.len() <= MAX_PAYLOAD_SIZE as usize);
	put_u32(out, entry.payload.len() as u32);
	put_u64(out, entry.term);
	out.push(if entry.committable { 1 } else { 0 });
	out.push(entry.kind.to_u8());
	out.extend_from_slice(&entry.payload);
}

/// Reads one entry frame, assigning it the given index
pub fn read_entry_frame(c: &mut Cursor<&[u8]>, index: LogIndex) -> Result<LogEntry> {
	let len = c.read_u32::<LittleEndian>()?;
	if len > MAX_PAYLOAD_SIZE {
		return Err(ErrorKind::Malformed(format!("entry payload of {} bytes", len)).into());
	}

	let term = c.read_u64::<LittleEndian>()?;
	let committable = match c.read_u8()? {
		0 => false,
		1 => true,
		v => return Err(ErrorKind::Malformed(format!("bad committable flag {}", v)).into()),
	};

	let kind = c.read_u8()?;
	let kind = EntryKind::from_u8(kind)
		.ok_or_else(|| Error::from(ErrorKind::Malformed(format!("bad entry kind {}", kind))))?;

	let mut payload = vec![0u8; len as usize];
	c.read_exact(&mut payload)?;

	Ok(LogEntry {
		index,
		term,
		committable,
		kind,
		payload: Bytes::from(payload),
	})
}

pub fn encode_message(body: &MessageBody) -> Vec<u8> {
	let mut out = Vec::new();

	match body {
		MessageBody::AppendEntries(req) => {
			debug_assert_eq!(req.entries.len() as u64, req.idx - req.prev_index);

			out.push(TAG_APPEND_ENTRIES);
			put_u64(&mut out, req.term);
			put_node_id(&mut out, &req.leader_id);
			put_u64(&mut out, req.prev_index);
			put_u64(&mut out, req.prev_term);
			put_u64(&mut out, req.leader_commit);
			put_u64(&mut out, req.term_of_idx);
			put_u64(&mut out, req.idx);

			for e in req.entries.iter() {
				put_entry_frame(&mut out, e);
			}
		}
		MessageBody::AppendEntriesResponse(resp) => {
			out.push(TAG_APPEND_ENTRIES_RESPONSE);
			put_u64(&mut out, resp.term);
			put_u64(&mut out, resp.last_log_index);

			match resp.result {
				AppendResult::Ok => out.push(RESULT_OK),
				AppendResult::Conflict { term, first_index } => {
					out.push(RESULT_CONFLICT);
					put_u64(&mut out, term);
					put_u64(&mut out, first_index);
				}
			}
		}
		MessageBody::RequestVote(req) => {
			out.push(TAG_REQUEST_VOTE);
			put_u64(&mut out, req.term);
			put_u64(&mut out, req.last_committable_index);
			put_u64(&mut out, req.term_of_last_committable_index);
		}
		MessageBody::RequestVoteResponse(resp) => {
			out.push(TAG_REQUEST_VOTE_RESPONSE);
			put_u64(&mut out, resp.term);
			out.push(if resp.vote_granted { 1 } else { 0 });
		}
		MessageBody::ProposeRequestVote(req) => {
			out.push(TAG_PROPOSE_REQUEST_VOTE);
			put_u64(&mut out, req.term);
		}
	}

	out
}

pub fn decode_message(data: &[u8]) -> Result<MessageBody> {
	let mut c = Cursor::new(data);

	let tag = c.read_u8()?;

	let body = match tag {
		TAG_APPEND_ENTRIES => {
			let term = c.read_u64::<LittleEndian>()?;
			let leader_id = read_node_id(&mut c)?;
			let prev_index = c.read_u64::<LittleEndian>()?;
			let prev_term = c.read_u64::<LittleEndian>()?;
			let leader_commit = c.read_u64::<LittleEndian>()?;
			let term_of_idx = c.read_u64::<LittleEndian>()?;
			let idx = c.read_u64::<LittleEndian>()?;

			if idx < prev_index {
				return Err(
					ErrorKind::Malformed(format!("batch end {} before prev {}", idx, prev_index)).into(),
				);
			}

			let count = idx - prev_index;
			if count > MAX_ENTRIES_PER_MESSAGE {
				return Err(ErrorKind::Malformed(format!("batch of {} entries", count)).into());
			}

			let mut entries = Vec::with_capacity(count as usize);
			for i in 0..count {
				entries.push(read_entry_frame(&mut c, prev_index + 1 + i)?);
			}

			MessageBody::AppendEntries(AppendEntriesRequest {
				term,
				leader_id,
				prev_index,
				prev_term,
				leader_commit,
				term_of_idx,
				idx,
				entries,
			})
		}
		TAG_APPEND_ENTRIES_RESPONSE => {
			let term = c.read_u64::<LittleEndian>()?;
			let last_log_index = c.read_u64::<LittleEndian>()?;

			let result = match c.read_u8()? {
				RESULT_OK => AppendResult::Ok,
				RESULT_CONFLICT => AppendResult::Conflict {
					term: c.read_u64::<LittleEndian>()?,
					first_index: c.read_u64::<LittleEndian>()?,
				},
				v => return Err(ErrorKind::Malformed(format!("bad append result {}", v)).into()),
			};

			MessageBody::AppendEntriesResponse(AppendEntriesResponse {
				term,
				last_log_index,
				result,
			})
		}
		TAG_REQUEST_VOTE => MessageBody::RequestVote(RequestVoteRequest {
			term: c.read_u64::<LittleEndian>()?,
			last_committable_index: c.read_u64::<LittleEndian>()?,
			term_of_last_committable_index: c.read_u64::<LittleEndian>()?,
		}),
		TAG_REQUEST_VOTE_RESPONSE => MessageBody::RequestVoteResponse(RequestVoteResponse {
			term: c.read_u64::<LittleEndian>()?,
			vote_granted: match c.read_u8()? {
				0 => false,
				1 => true,
				v => return Err(ErrorKind::Malformed(format!("bad vote flag {}", v)).into()),
			},
		}),
		TAG_PROPOSE_REQUEST_VOTE => MessageBody::ProposeRequestVote(ProposeRequestVote {
			term: c.read_u64::<LittleEndian>()?,
		}),
		v => return Err(ErrorKind::Malformed(format!("unknown message tag {}", v)).into()),
	};

	if (c.position() as usize) != data.len() {
		return Err(ErrorKind::Malformed("trailing bytes after message".into()).into());
	}

	Ok(body)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(index: LogIndex, term: Term, payload: &[u8], committable: bool, kind: EntryKind) -> LogEntry {
		LogEntry {
			index,
			term,
			committable,
			kind,
			payload: Bytes::copy_from_slice(payload),
		}
	}

	fn roundtrip(body: MessageBody) {
		let data = encode_message(&body);
		let back = decode_message(&data).unwrap();
		assert_eq!(body, back);
	}

	#[test]
	fn append_entries_roundtrip() {
		roundtrip(MessageBody::AppendEntries(AppendEntriesRequest {
			term: 7,
			leader_id: NodeId::from("n1"),
			prev_index: 3,
			prev_term: 6,
			leader_commit: 2,
			term_of_idx: 7,
			idx: 5,
			entries: vec![
				entry(4, 6, b"alpha", false, EntryKind::Raw),
				entry(5, 7, b"", true, EntryKind::Signature),
			],
		}));
	}

	#[test]
	fn heartbeat_roundtrip() {
		roundtrip(MessageBody::AppendEntries(AppendEntriesRequest {
			term: 3,
			leader_id: NodeId::from("leader"),
			prev_index: 9,
			prev_term: 3,
			leader_commit: 9,
			term_of_idx: 3,
			idx: 9,
			entries: vec![],
		}));
	}

	#[test]
	fn append_entries_response_roundtrip() {
		roundtrip(MessageBody::AppendEntriesResponse(AppendEntriesResponse {
			term: 4,
			last_log_index: 17,
			result: AppendResult::Ok,
		}));

		roundtrip(MessageBody::AppendEntriesResponse(AppendEntriesResponse {
			term: 4,
			last_log_index: 17,
			result: AppendResult::Conflict {
				term: 2,
				first_index: 11,
			},
		}));
	}

	#[test]
	fn request_vote_roundtrip() {
		roundtrip(MessageBody::RequestVote(RequestVoteRequest {
			term: 9,
			last_committable_index: 42,
			term_of_last_committable_index: 8,
		}));

		roundtrip(MessageBody::RequestVoteResponse(RequestVoteResponse {
			term: 9,
			vote_granted: true,
		}));
	}

	#[test]
	fn propose_request_vote_roundtrip() {
		roundtrip(MessageBody::ProposeRequestVote(ProposeRequestVote { term: 5 }));
	}

	#[test]
	fn rejects_garbage() {
		assert!(decode_message(&[]).is_err());
		assert!(decode_message(&[99, 0, 0]).is_err());

		// Truncated header
		let mut data = encode_message(&MessageBody::ProposeRequestVote(ProposeRequestVote { term: 5 }));
		data.truncate(4);
		assert!(decode_message(&data).is_err());

		// Trailing junk after a complete message
		let mut data = encode_message(&MessageBody::RequestVoteResponse(RequestVoteResponse {
			term: 1,
			vote_granted: false,
		}));
		data.push(0);
		assert!(decode_message(&data).is_err());
	}

	#[test]
	fn rejects_inconsistent_batch_bounds() {
		let mut data = Vec::new();
		data.push(TAG_APPEND_ENTRIES);
		put_u64(&mut data, 1);
		put_node_id(&mut data, &NodeId::from("x"));
		put_u64(&mut data, 5); // prev_index
		put_u64(&mut data, 1);
		put_u64(&mut data, 0);
		put_u64(&mut data, 1);
		put_u64(&mut data, 3); // idx < prev_index

		assert!(decode_message(&data).is_err());
	}

	#[test]
	fn marshal_roundtrip() {
		let mut nodes = std::collections::BTreeMap::new();
		nodes.insert(
			NodeId::from("a"),
			NodeAddr {
				hostname: "10.0.0.1".into(),
				port: 4100,
			},
		);

		let config = Configuration::new(5, nodes);
		let data = marshal(&config).unwrap();
		let back: Configuration = unmarshal(&data).unwrap();
		assert_eq!(config, back);
	}
}
