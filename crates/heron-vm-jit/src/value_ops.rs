//! Value-representation backends for code generation.
//!
//! Opcode codegen is written once against [`ValueOps`] and instantiated with
//! [`NanBoxOps`] or [`TagPayloadOps`]. Both mirror the runtime encodings in
//! `heron_vm_value::repr` bit for bit.
//!
//! Type checks return Cranelift `i8` booleans. Boxing helpers never branch.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{InstBuilder, MemFlags, Value, types};
use cranelift_frontend::FunctionBuilder;
use heron_vm_value::{Encoding, NanBox, TagPayload, ValueRepr};

pub trait ValueOps {
    /// Runtime encoding this backend emits
    type Repr: ValueRepr;
    const ENCODING: Encoding;

    fn is_int32(b: &mut FunctionBuilder, v: Value) -> Value;
    fn is_double(b: &mut FunctionBuilder, v: Value) -> Value;
    fn is_cell(b: &mut FunctionBuilder, v: Value) -> Value;

    fn is_number(b: &mut FunctionBuilder, v: Value) -> Value {
        let i = Self::is_int32(b, v);
        let d = Self::is_double(b, v);
        b.ins().bor(i, d)
    }

    fn both_int32(b: &mut FunctionBuilder, l: Value, r: Value) -> Value {
        let li = Self::is_int32(b, l);
        let ri = Self::is_int32(b, r);
        b.ins().band(li, ri)
    }

    fn both_number(b: &mut FunctionBuilder, l: Value, r: Value) -> Value {
        let ln = Self::is_number(b, l);
        let rn = Self::is_number(b, r);
        b.ins().band(ln, rn)
    }

    /// Payload of an int32 word as an `i32`
    fn unbox_int32(b: &mut FunctionBuilder, v: Value) -> Value {
        b.ins().ireduce(types::I32, v)
    }

    fn box_int32(b: &mut FunctionBuilder, n: Value) -> Value;

    fn unbox_double(b: &mut FunctionBuilder, v: Value) -> Value {
        b.ins().bitcast(types::F64, MemFlags::new(), v)
    }

    /// Box an `f64`, canonicalising NaN
    fn box_double(b: &mut FunctionBuilder, d: Value) -> Value {
        let bits = b.ins().bitcast(types::I64, MemFlags::new(), d);
        let nan = b.ins().iconst(types::I64, Self::Repr::CANONICAL_NAN as i64);
        let is_nan = b.ins().fcmp(FloatCC::Unordered, d, d);
        b.ins().select(is_nan, nan, bits)
    }

    /// Int32 or double word to `f64`. Caller guarantees the word is a number.
    fn number_to_f64(b: &mut FunctionBuilder, v: Value) -> Value {
        let is_int = Self::is_int32(b, v);
        let n = Self::unbox_int32(b, v);
        let from_int = b.ins().fcvt_from_sint(types::F64, n);
        let from_double = Self::unbox_double(b, v);
        b.ins().select(is_int, from_int, from_double)
    }

    /// Cell index as an `i64`
    fn unbox_cell_index(b: &mut FunctionBuilder, v: Value) -> Value {
        let idx = b.ins().ireduce(types::I32, v);
        b.ins().uextend(types::I64, idx)
    }

    fn box_bool(b: &mut FunctionBuilder, cond: Value) -> Value {
        let t = b.ins().iconst(types::I64, Self::Repr::TRUE as i64);
        let f = b.ins().iconst(types::I64, Self::Repr::FALSE as i64);
        b.ins().select(cond, t, f)
    }

    fn undefined(b: &mut FunctionBuilder) -> Value {
        b.ins().iconst(types::I64, Self::Repr::UNDEFINED as i64)
    }

    fn sentinel(b: &mut FunctionBuilder) -> Value {
        b.ins().iconst(types::I64, Self::Repr::EXCEPTION_SENTINEL as i64)
    }

    fn is_sentinel(b: &mut FunctionBuilder, v: Value) -> Value {
        b.ins()
            .icmp_imm(IntCC::Equal, v, Self::Repr::EXCEPTION_SENTINEL as i64)
    }
}

pub struct NanBoxOps;

impl ValueOps for NanBoxOps {
    type Repr = NanBox;
    const ENCODING: Encoding = Encoding::NanBox;

    fn is_int32(b: &mut FunctionBuilder, v: Value) -> Value {
        let tag = b.ins().band_imm(v, NanBox::INT32_TAG_MASK as i64);
        b.ins().icmp_imm(IntCC::Equal, tag, NanBox::TAG_INT32 as i64)
    }

    fn is_double(b: &mut FunctionBuilder, v: Value) -> Value {
        let quiet = b.ins().band_imm(v, NanBox::QUIET_NAN as i64);
        let not_boxed = b.ins().icmp_imm(IntCC::NotEqual, quiet, NanBox::QUIET_NAN as i64);
        let canonical = b
            .ins()
            .icmp_imm(IntCC::Equal, v, NanBox::CANONICAL_NAN as i64);
        b.ins().bor(not_boxed, canonical)
    }

    fn is_cell(b: &mut FunctionBuilder, v: Value) -> Value {
        let tag = b.ins().band_imm(v, NanBox::CELL_TAG_MASK as i64);
        b.ins().icmp_imm(IntCC::Equal, tag, NanBox::TAG_CELL as i64)
    }

    fn box_int32(b: &mut FunctionBuilder, n: Value) -> Value {
        let extended = b.ins().uextend(types::I64, n);
        b.ins().bor_imm(extended, NanBox::TAG_INT32 as i64)
    }
}

pub struct TagPayloadOps;

impl TagPayloadOps {
    fn tag_word(b: &mut FunctionBuilder, v: Value) -> Value {
        b.ins().ushr_imm(v, 32)
    }
}

impl ValueOps for TagPayloadOps {
    type Repr = TagPayload;
    const ENCODING: Encoding = Encoding::TagPayload;

    fn is_int32(b: &mut FunctionBuilder, v: Value) -> Value {
        let tag = Self::tag_word(b, v);
        b.ins()
            .icmp_imm(IntCC::Equal, tag, i64::from(TagPayload::INT32_TAG))
    }

    fn is_double(b: &mut FunctionBuilder, v: Value) -> Value {
        let tag = Self::tag_word(b, v);
        b.ins().icmp_imm(
            IntCC::UnsignedLessThan,
            tag,
            i64::from(TagPayload::LOWEST_TAG),
        )
    }

    fn is_cell(b: &mut FunctionBuilder, v: Value) -> Value {
        let tag = Self::tag_word(b, v);
        b.ins()
            .icmp_imm(IntCC::Equal, tag, i64::from(TagPayload::CELL_TAG))
    }

    fn box_int32(b: &mut FunctionBuilder, n: Value) -> Value {
        let extended = b.ins().uextend(types::I64, n);
        b.ins()
            .bor_imm(extended, TagPayload::pack(TagPayload::INT32_TAG, 0) as i64)
    }
}
