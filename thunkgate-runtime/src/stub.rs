//! # Trampoline Stub Templates
//!
//! Machine-code templates stamped into trampoline pages.
//!
//! ## Layout
//!
//! A trampoline page is a data page immediately followed by a code page of
//! the same size. Both are divided into [`SLOT_STRIDE`]-byte strides:
//!
//! ```text
//!            data page (RW)                      code page (RX)
//! ┌──────────────────────────────┐   ┌──────────────────────────────────┐
//! │ stride 0: unused             │   │ stride 0: shared dispatcher      │
//! │ stride 1: [closure, slot id] │   │ stride 1: lea cfg; jmp dispatch  │
//! │ stride 2: [closure, slot id] │   │ stride 2: lea cfg; jmp dispatch  │
//! │ ...                          │   │ ...                              │
//! └──────────────────────────────┘   └──────────────────────────────────┘
//! ```
//!
//! Each stub materializes the address of its own config record (exactly one
//! page below itself) in a scratch register and branches to the dispatcher
//! at the start of its code page. The dispatcher rewrites the argument
//! registers for the closure's invoke entry and tail-jumps through the
//! first word of the closure header. Nothing touches the stack, so the
//! callee returns straight to the original caller.
//!
//! ## Argument rewriting
//!
//! | Convention     | Handle called as                   | Invoke receives                    |
//! |----------------|------------------------------------|------------------------------------|
//! | `Standard`     | `(receiver, selector, args..)`     | `(closure, receiver, args..)`      |
//! | `StructReturn` | `(result, receiver, selector, ..)` | `(result, closure, receiver, ..)`  |
//!
//! On AArch64 the hidden result pointer travels in `x8`, so a single
//! dispatcher serves both shapes and there is no `StructReturn` variant.

use std::fmt;

/// Size of one slot stride (stub or config record) in bytes.
pub const SLOT_STRIDE: usize = 16;

/// Number of leading strides in each code page reserved for the dispatcher.
pub const DISPATCHER_STRIDES: usize = 1;

/// Filler for unused x86-64 code bytes (`int3`).
const X64_TRAP: u8 = 0xCC;

/// Filler for unused AArch64 code words (`brk #0`).
const A64_TRAP: u32 = 0xD420_0000;

/// Calling-convention variant a trampoline is shaped for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// Ordinary call: the result comes back in registers.
    Standard,
    /// The caller passes a hidden pointer that receives an aggregate result.
    StructReturn,
}

impl CallingConvention {
    /// Short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallingConvention::Standard => "standard",
            CallingConvention::StructReturn => "struct-return",
        }
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine ABI that stub templates are generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Abi {
    /// x86-64 System V (Linux, macOS, BSDs).
    SysV64,
    /// x86-64 Microsoft x64.
    Win64,
    /// AArch64 AAPCS64 (including Apple's variant).
    Aarch64,
}

impl Abi {
    /// The ABI of the running process, if trampolines are supported on it.
    pub const fn host() -> Option<Abi> {
        if cfg!(all(target_arch = "x86_64", windows)) {
            Some(Abi::Win64)
        } else if cfg!(target_arch = "x86_64") {
            Some(Abi::SysV64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Abi::Aarch64)
        } else {
            None
        }
    }

    /// Whether aggregate returns need their own trampoline shape.
    pub const fn has_struct_return_variant(self) -> bool {
        !matches!(self, Abi::Aarch64)
    }

    /// Short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Abi::SysV64 => "sysv64",
            Abi::Win64 => "win64",
            Abi::Aarch64 => "aarch64",
        }
    }

    /// Generate the shared dispatcher for `convention`.
    ///
    /// On ABIs without a struct-return variant the standard dispatcher is
    /// returned for either convention.
    pub fn dispatcher(self, convention: CallingConvention) -> [u8; SLOT_STRIDE] {
        let mut out = [X64_TRAP; SLOT_STRIDE];
        match (self, convention) {
            (Abi::SysV64, CallingConvention::Standard) => {
                out[..8].copy_from_slice(&[
                    0x48, 0x89, 0xFE, // mov rsi, rdi
                    0x49, 0x8B, 0x3B, // mov rdi, [r11]
                    0xFF, 0x27, // jmp [rdi]
                ]);
            }
            (Abi::SysV64, CallingConvention::StructReturn) => {
                out[..8].copy_from_slice(&[
                    0x48, 0x89, 0xF2, // mov rdx, rsi
                    0x49, 0x8B, 0x33, // mov rsi, [r11]
                    0xFF, 0x26, // jmp [rsi]
                ]);
            }
            (Abi::Win64, CallingConvention::Standard) => {
                out[..8].copy_from_slice(&[
                    0x48, 0x89, 0xCA, // mov rdx, rcx
                    0x49, 0x8B, 0x0B, // mov rcx, [r11]
                    0xFF, 0x21, // jmp [rcx]
                ]);
            }
            (Abi::Win64, CallingConvention::StructReturn) => {
                out[..8].copy_from_slice(&[
                    0x49, 0x89, 0xD0, // mov r8, rdx
                    0x49, 0x8B, 0x13, // mov rdx, [r11]
                    0xFF, 0x22, // jmp [rdx]
                ]);
            }
            (Abi::Aarch64, _) => {
                write_words(
                    &mut out,
                    &[
                        0xAA00_03E1, // mov x1, x0
                        0xF940_0200, // ldr x0, [x16]
                        0xF940_0011, // ldr x17, [x0]
                        0xD61F_0220, // br x17
                    ],
                );
            }
        }
        out
    }

    /// Generate the trampoline stub for the stride at `slot_index` of a
    /// code page, where the page size is `page_size` bytes.
    ///
    /// The stub is the same for every calling convention; only the
    /// dispatcher it branches to differs.
    pub fn trampoline(self, slot_index: usize, page_size: usize) -> [u8; SLOT_STRIDE] {
        debug_assert!(slot_index >= DISPATCHER_STRIDES);
        debug_assert!((slot_index + 1) * SLOT_STRIDE <= page_size);

        let slot_offset = (slot_index * SLOT_STRIDE) as i32;
        let page = page_size as i32;

        match self {
            Abi::SysV64 | Abi::Win64 => {
                let mut out = [X64_TRAP; SLOT_STRIDE];
                // lea r11, [rip + disp32]; rip is the stub base + 7.
                let config_disp = -page - 7;
                out[0..3].copy_from_slice(&[0x4C, 0x8D, 0x1D]);
                out[3..7].copy_from_slice(&config_disp.to_le_bytes());
                // jmp rel32 to the dispatcher at code offset 0; rel is from the
                // end of the jmp (stub base + 12).
                let dispatch_rel = -(slot_offset + 12);
                out[7] = 0xE9;
                out[8..12].copy_from_slice(&dispatch_rel.to_le_bytes());
                out
            }
            Abi::Aarch64 => {
                let mut out = [0u8; SLOT_STRIDE];
                write_words(
                    &mut out,
                    &[
                        encode_adr(16, -page),
                        encode_b(-(slot_offset + 4)),
                        A64_TRAP,
                        A64_TRAP,
                    ],
                );
                out
            }
        }
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode `adr x<rd>, #offset`. The offset must fit in 21 signed bits.
fn encode_adr(rd: u32, offset: i32) -> u32 {
    debug_assert!((-(1 << 20)..(1 << 20)).contains(&offset));
    let imm = offset as u32;
    let immlo = imm & 0x3;
    let immhi = (imm >> 2) & 0x7_FFFF;
    (immlo << 29) | 0x1000_0000 | (immhi << 5) | rd
}

/// Encode `b #offset` relative to the branch instruction itself.
fn encode_b(offset: i32) -> u32 {
    debug_assert!(offset % 4 == 0);
    0x1400_0000 | (((offset >> 2) as u32) & 0x03FF_FFFF)
}

fn write_words(out: &mut [u8; SLOT_STRIDE], words: &[u32; 4]) {
    for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}
