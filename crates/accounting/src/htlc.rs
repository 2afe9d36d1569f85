use crate::AuditError;
use bitcoin::blockdata::opcodes::all::OP_CHECKSIG;
use bitcoin::blockdata::opcodes::all::OP_CLTV;
use bitcoin::blockdata::opcodes::all::OP_DROP;
use bitcoin::blockdata::opcodes::all::OP_ELSE;
use bitcoin::blockdata::opcodes::all::OP_ENDIF;
use bitcoin::blockdata::opcodes::all::OP_EQUAL;
use bitcoin::blockdata::opcodes::all::OP_EQUALVERIFY;
use bitcoin::blockdata::opcodes::all::OP_HASH160;
use bitcoin::blockdata::opcodes::all::OP_IF;
use bitcoin::blockdata::opcodes::all::OP_SIZE;
use bitcoin::blockdata::script::Instruction;
use bitcoin::Script;
use bitcoin::Transaction;

/// How a transaction spends an HTLC output, if it does at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendKind {
    /// Not a recognised HTLC spend.
    Unknown,
    /// The preimage was revealed; the claim path of the HTLC.
    Success,
    /// The HTLC expired and was reclaimed through the timeout path.
    Timeout,
}

/// One element of the expected witness script.
enum TemplateItem {
    Op(bitcoin::blockdata::opcodes::All),
    /// A data push matched by exact content.
    Data(&'static [u8]),
    /// A data push matched by length only.
    DataLen(usize),
}

/// Decide whether `tx` spends a Lightning HTLC output, and through which
/// path.
///
/// The shape of an HTLC spend is fixed: a single input whose witness is
/// `[signature, preimage-or-nil, script]`. A 32-byte second element claims
/// with the preimage, a single zero byte takes the timeout path. The third
/// element must be the HTLC witness script itself.
///
/// `confirmation_height` is the height the spend confirmed at. The CLTV
/// operand inside the script is matched by the byte length of that height's
/// minimal encoding rather than by value, since the HTLC's absolute expiry
/// is not known here.
pub fn classify_spend(tx: &Transaction, confirmation_height: u32) -> Result<SpendKind, AuditError> {
    if confirmation_height == 0 {
        return Err(AuditError::InvalidInput(
            "confirmation height hint must be positive".to_string(),
        ));
    }

    if tx.input.len() != 1 {
        return Ok(SpendKind::Unknown);
    }

    let witness: Vec<&[u8]> = tx.input[0].witness.iter().collect();
    if witness.len() != 3 {
        return Ok(SpendKind::Unknown);
    }

    let candidate = if witness[1] == [0u8] {
        SpendKind::Timeout
    } else if witness[1].len() == 32 {
        SpendKind::Success
    } else {
        return Ok(SpendKind::Unknown);
    };

    let script = Script::from(witness[2].to_vec());
    if matches_htlc_script(&script, confirmation_height) {
        Ok(candidate)
    } else {
        Ok(SpendKind::Unknown)
    }
}

fn matches_htlc_script(script: &Script, confirmation_height: u32) -> bool {
    use TemplateItem::*;

    let template = [
        Op(OP_SIZE),
        Data(&[0x20]),
        Op(OP_EQUAL),
        Op(OP_IF),
        Op(OP_HASH160),
        DataLen(20),
        Op(OP_EQUALVERIFY),
        DataLen(33),
        Op(OP_ELSE),
        Op(OP_DROP),
        DataLen(script_int_len(confirmation_height)),
        Op(OP_CLTV),
        Op(OP_DROP),
        DataLen(33),
        Op(OP_ENDIF),
        Op(OP_CHECKSIG),
    ];

    let mut instructions = script.instructions_minimal();
    for item in template {
        let instruction = match instructions.next() {
            Some(Ok(instruction)) => instruction,
            // Truncated or non-minimal scripts cannot be HTLC scripts.
            Some(Err(_)) | None => return false,
        };

        let matched = match (item, instruction) {
            (Op(op), Instruction::Op(parsed)) => parsed == op,
            (Data(bytes), Instruction::PushBytes(parsed)) => parsed == bytes,
            (DataLen(len), Instruction::PushBytes(parsed)) => parsed.len() == len,
            _ => false,
        };
        if !matched {
            return false;
        }
    }

    // The template must consume the whole script.
    instructions.next().is_none()
}

/// Byte length of the minimal script-integer encoding of `value`.
fn script_int_len(value: u32) -> usize {
    let mut len = 0;
    let mut rest = value;
    while rest > 0 {
        len += 1;
        rest >>= 8;
    }

    // A set top bit would flip the sign, so minimal encodings append a
    // zero byte.
    let top_byte = (value >> (8 * (len as u32 - 1))) & 0xff;
    if top_byte & 0x80 != 0 {
        len += 1;
    }

    len
}
