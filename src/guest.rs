//! Built-in guest images.
//!
//! Guest images are flat 16-bit real-mode machine code, loaded at offset 0
//! of guest memory and entered at the first byte. No header, no relocation.

/// Add `BL` to `AL`, print the sum as an ASCII digit and a newline on COM1,
/// then halt.
///
/// With the default registers (`RAX = 4`, `RBX = 2`) the guest writes `"6\n"`.
/// The sum must stay below 10 to remain a single digit.
pub const ADD_AND_PRINT: [u8; 12] = [
    0xba, 0xf8, 0x03, // mov $0x3f8, %dx
    0x00, 0xd8, // add %bl, %al
    0x04, b'0', // add $'0', %al
    0xee, // out %al, (%dx)
    0xb0, b'\n', // mov $'\n', %al
    0xee, // out %al, (%dx)
    0xf4, // hlt
];
