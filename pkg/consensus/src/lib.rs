#[macro_use]
extern crate error_chain;

pub mod errors {
	error_chain! {
		foreign_links {
			Io(::std::io::Error);
			MsgEncode(::rmp_serde::encode::Error);
			MsgDecode(::rmp_serde::decode::Error);
		}

		errors {
			// A safety invariant was violated; the node halts rather than keep
			// running on corrupt state
			InvariantBreach(msg: String) {
				description("consensus invariant breach")
				display("invariant breach: {}", msg)
			}

			// Input that failed structural validation (bad wire bytes, inconsistent
			// request shapes, out-of-order appends)
			Malformed(msg: String) {
				description("malformed input")
				display("malformed: {}", msg)
			}
		}
	}
}

pub mod protos;
pub mod wire;
pub mod log;
pub mod log_file;
pub mod state;
pub mod config_state;
pub mod constraint;
pub mod state_machine;
pub mod channel;
pub mod clock;
pub mod consensus;
pub mod sim;
