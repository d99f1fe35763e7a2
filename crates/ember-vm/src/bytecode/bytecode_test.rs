// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for bytecode encoding and decoding.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;

#[test]
fn encode_decode_abc_roundtrip() {
    let cases = [
        (0u8, 0u8, 0u8, 0u8),
        (op::ADD, 5, 10, 15),
        (op::CALL, 255, 255, 255), // max values
        (op::ARRGET, 128, 64, 32),
    ];

    for (opcode, a, b, c) in cases {
        let ins = encode_abc(opcode, a, b, c);
        assert_eq!(decode_opcode(ins), opcode, "opcode mismatch");
        assert_eq!(decode_a(ins), a, "A mismatch");
        assert_eq!(decode_b(ins), b, "B mismatch");
        assert_eq!(decode_c(ins), c, "C mismatch");
    }
}

#[test]
fn encode_decode_mid_roundtrip() {
    let cases = [
        (op::LDSYM, 0u8, 0u16),
        (op::LDSYM, 3, 12345),
        (op::GLBVAL, 255, u16::MAX),
    ];

    for (opcode, a, mid) in cases {
        let ins = encode_mid(opcode, a, mid);
        assert_eq!(decode_opcode(ins), opcode, "opcode mismatch");
        assert_eq!(decode_a(ins), a, "A mismatch");
        assert_eq!(decode_mid(ins), mid, "mid mismatch");
    }
}

#[test]
fn mid_field_overlays_b_and_c() {
    // mid is B||C, little-endian: B is the low octet.
    let ins = encode_abc(op::LDSYM, 1, 0x34, 0x12);
    assert_eq!(decode_mid(ins), 0x1234);
}

#[test]
fn encode_decode_long_roundtrip() {
    let ins = encode_long(locsym::STRCONST, 0xDEAD_BEEF);
    assert_eq!(decode_opcode(ins), locsym::STRCONST);
    assert_eq!(decode_long(ins), 0xDEAD_BEEF);

    // The long field covers everything above the low 16 bits.
    let ins = encode_long(locsym::SYMSTUB, (1 << 48) - 1);
    assert_eq!(decode_long(ins), (1 << 48) - 1);
}

#[test]
fn instruction_field_boundaries() {
    // opcode in octet 0, A in octet 1, B in octet 2, C in octet 3
    assert_eq!(encode_abc(0xFF, 0, 0, 0), 0x0000_00FF);
    assert_eq!(encode_abc(0, 0xFF, 0, 0), 0x0000_FF00);
    assert_eq!(encode_abc(0, 0, 0xFF, 0), 0x00FF_0000);
    assert_eq!(encode_abc(0, 0, 0, 0xFF), 0xFF00_0000);
}

#[test]
fn words_for_octets_rounds_up() {
    assert_eq!(words_for_octets(0), 0);
    assert_eq!(words_for_octets(1), 1);
    assert_eq!(words_for_octets(8), 1);
    assert_eq!(words_for_octets(9), 2);
    assert_eq!(words_for_octets(16), 2);
    assert_eq!(words_for_octets(17), 3);
}

#[test]
fn words_for_name_counts_the_terminator() {
    // 7 bytes + NUL fit one word; 8 bytes + NUL need two.
    assert_eq!(words_for_name(0), 1);
    assert_eq!(words_for_name(7), 1);
    assert_eq!(words_for_name(8), 2);
    assert_eq!(words_for_name(15), 2);
}

#[test]
fn pack_unpack_name_roundtrip() {
    for name in ["", "x", "println", "a_longer_symbol_name", "mixed123"] {
        let words = pack_name(name);
        assert_eq!(words.len(), words_for_name(name.len()));
        let back = unpack_name(&words, name.len()).unwrap();
        assert_eq!(back, name);
    }
}

#[test]
fn unpack_name_rejects_truncated_payload() {
    let words = pack_name("a_longer_symbol_name");
    assert!(unpack_name(&words[..1], "a_longer_symbol_name".len()).is_none());
}

#[test]
fn nth_arg_index_unpacks_octets() {
    // Argument register indices pack 8 per word, low octet first.
    let mut words = vec![0 as Word; 2];
    for (i, reg) in [3u8, 1, 4, 1, 5, 9, 2, 6, 5, 3].iter().enumerate() {
        words[i / WORD_OCTETS] |= (u64::from(*reg)) << ((i % WORD_OCTETS) * 8);
    }

    assert_eq!(nth_arg_index(&words, 0), 3);
    assert_eq!(nth_arg_index(&words, 1), 1);
    assert_eq!(nth_arg_index(&words, 7), 6);
    assert_eq!(nth_arg_index(&words, 8), 5);
    assert_eq!(nth_arg_index(&words, 9), 3);
}
