//! Deferred command representation: opcodes, records and the singly linked command list.
//!
//! A [`CommandList`] is built on the producer thread, moved through the submission queue and
//! consumed record by record on the dispatcher thread. It is owned by exactly one stage at a
//! time, so nothing in here is synchronized.

mod codec;

pub use codec::{ArgBuffer, ArgReader, DecodeError};

use core::ptr::NonNull;

macro_rules! opcodes {
    ($($(#[$vmeta:meta])* $variant:ident = $value:literal,)+) => {
        /// Opcodes understood by the core dispatcher.
        ///
        /// Values are stable; raw opcodes at or above [`Opcode::EXTENSION_BASE`] belong to
        /// command sets layered on top of this one and are routed to the extension hook.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Opcode {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl Opcode {
            pub fn from_raw(raw: u16) -> Option<Self> {
                match raw {
                    $($value => Some(Opcode::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    // Resource lifecycle.
    CreateTexture = 0x0001,
    UpdateTexture = 0x0002,
    CreateBuffer = 0x0003,
    UpdateBuffer = 0x0004,
    CreateProgram = 0x0005,
    CreateInputLayout = 0x0006,
    CreateBitmap = 0x0007,
    DestroyResource = 0x0008,
    SetTextureFilter = 0x0009,

    // Fixed-function and binding state.
    SetViewport = 0x0100,
    ClipRect = 0x0101,
    SetFeature = 0x0102,
    BlendFormula = 0x0103,
    StencilAction = 0x0104,
    StencilPassCondition = 0x0105,
    StencilMask = 0x0106,
    DepthMask = 0x0107,
    DepthFunc = 0x0108,
    CullFace = 0x0109,
    FrontFaceRule = 0x010A,
    ColorMask = 0x010B,
    LineWidth = 0x010C,
    DepthBias = 0x010D,
    PointSize = 0x010E,
    PenStyle = 0x010F,
    BrushColor = 0x0110,
    UseProgram = 0x0111,
    BindTexture = 0x0112,
    SetUniform = 0x0113,
    SetTextureForShader = 0x0114,
    BindVertexBuffers = 0x0115,
    BindIndexBuffer = 0x0116,
    BindInputLayout = 0x0117,
    BindBitmap = 0x0118,
    SetSwapchainSize = 0x0119,

    // Drawing.
    Clear = 0x0200,
    DrawIndexed = 0x0201,
    DrawArray = 0x0202,
    DrawRectangle = 0x0203,
    DrawLine = 0x0204,
    DrawPolygon = 0x0205,
    DrawBitmap = 0x0206,

    // Synchronization with the host overlay and the presentation surface.
    BackupState = 0x0300,
    RestoreState = 0x0301,
    /// Present the current frame and signal the command's completion fence.
    Display = 0x0302,
}

impl Opcode {
    pub const EXTENSION_BASE: u16 = 0x8000;

    pub fn raw(self) -> u16 {
        self as u16
    }
}

/// One encoded operation: an opcode plus its argument bytes.
pub struct Command {
    opcode: u16,
    args: ArgBuffer,
    next: Option<Box<Command>>,
}

impl Command {
    pub fn raw_opcode(&self) -> u16 {
        self.opcode
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_raw(self.opcode)
    }

    pub fn args(&self) -> &ArgBuffer {
        &self.args
    }
}

impl core::fmt::Debug for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Command")
            .field("opcode", &format_args!("0x{:04X}", self.opcode))
            .field("args", &self.args)
            .finish()
    }
}

/// The chain of records has fewer or more links than the list recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("command list chain is inconsistent (expected {expected} more records)")]
pub struct ListCorrupted {
    pub expected: usize,
}

/// Singly linked, append-only sequence of [`Command`]s.
///
/// `head` owns the chain; `tail` is a non-owning cursor to the last record so appends are O(1).
#[derive(Default)]
pub struct CommandList {
    head: Option<Box<Command>>,
    tail: Option<NonNull<Command>>,
    len: usize,
}

// SAFETY: `tail` only ever points into the chain owned by `head`, so moving the list to another
// thread moves everything the pointer can reach along with it.
#[allow(unsafe_code)]
unsafe impl Send for CommandList {}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a record. Raw opcodes outside [`Opcode`] are allowed for layered command sets.
    #[allow(unsafe_code)]
    pub fn push_raw(&mut self, opcode: u16, args: ArgBuffer) {
        let mut node = Box::new(Command {
            opcode,
            args,
            next: None,
        });
        let node_ptr = NonNull::from(&mut *node);
        match self.tail {
            None => self.head = Some(node),
            // SAFETY: `tail` points at the last record of the chain owned by `self.head`, and we
            // hold `&mut self`, so no other reference to that record exists.
            Some(mut tail) => unsafe { tail.as_mut().next = Some(node) },
        }
        self.tail = Some(node_ptr);
        self.len += 1;
    }

    pub fn push(&mut self, opcode: Opcode, args: ArgBuffer) {
        self.push_raw(opcode.raw(), args);
    }

    /// Moves all records of `other` to the end of this list.
    #[allow(unsafe_code)]
    pub fn append(&mut self, other: &mut CommandList) {
        let Some(other_head) = other.head.take() else {
            return;
        };
        match self.tail {
            None => self.head = Some(other_head),
            // SAFETY: see `push_raw`.
            Some(mut tail) => unsafe { tail.as_mut().next = Some(other_head) },
        }
        self.tail = other.tail.take();
        self.len += core::mem::take(&mut other.len);
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head.as_deref(),
        }
    }

    /// Detaches the first record, transferring its ownership to the caller.
    ///
    /// Errors if the link chain disagrees with the recorded length; the remaining records must
    /// not be interpreted in that case.
    pub fn take_front(&mut self) -> Result<Option<Box<Command>>, ListCorrupted> {
        match self.head.take() {
            None if self.len == 0 => Ok(None),
            None => Err(ListCorrupted { expected: self.len }),
            Some(_) if self.len == 0 => Err(ListCorrupted { expected: 0 }),
            Some(mut node) => {
                self.head = node.next.take();
                self.len -= 1;
                if self.head.is_none() {
                    self.tail = None;
                }
                Ok(Some(node))
            }
        }
    }

    /// Drops all records without executing them.
    pub fn clear(&mut self) {
        let mut cur = self.head.take();
        while let Some(mut node) = cur {
            cur = node.next.take();
        }
        self.tail = None;
        self.len = 0;
    }

    #[cfg(test)]
    pub(crate) fn set_len_for_test(&mut self, len: usize) {
        self.len = len;
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        // Unlink iteratively; the default recursive drop overflows the stack on long lists.
        self.clear();
    }
}

impl core::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandList")
            .field("len", &self.len)
            .finish()
    }
}

pub struct Iter<'a> {
    next: Option<&'a Command>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Command;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = cur.next.as_deref();
        Some(cur)
    }
}

impl<'a> IntoIterator for &'a CommandList {
    type Item = &'a Command;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_u32(v: u32) -> ArgBuffer {
        let mut args = ArgBuffer::new();
        args.push(v);
        args
    }

    #[test]
    fn append_preserves_insertion_order() {
        let mut list = CommandList::new();
        for i in 0..5 {
            list.push_raw(0x8000 + i, args_u32(u32::from(i)));
        }
        assert_eq!(list.len(), 5);
        let ops: Vec<u16> = list.iter().map(Command::raw_opcode).collect();
        assert_eq!(ops, vec![0x8000, 0x8001, 0x8002, 0x8003, 0x8004]);
    }

    #[test]
    fn take_front_drains_and_resets_tail() {
        let mut list = CommandList::new();
        list.push(Opcode::Clear, ArgBuffer::new());
        list.push(Opcode::Display, args_u32(1));

        assert_eq!(
            list.take_front().unwrap().unwrap().opcode(),
            Some(Opcode::Clear)
        );
        assert_eq!(
            list.take_front().unwrap().unwrap().opcode(),
            Some(Opcode::Display)
        );
        assert!(list.take_front().unwrap().is_none());

        // The tail must not dangle after the list was emptied.
        list.push(Opcode::BackupState, ArgBuffer::new());
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().count(), 1);
    }

    #[test]
    fn lists_concatenate() {
        let mut a = CommandList::new();
        a.push(Opcode::Clear, ArgBuffer::new());
        let mut b = CommandList::new();
        b.push(Opcode::DrawArray, ArgBuffer::new());
        b.push(Opcode::Display, ArgBuffer::new());

        a.append(&mut b);
        assert!(b.is_empty());
        a.push(Opcode::RestoreState, ArgBuffer::new());

        let ops: Vec<_> = a.iter().filter_map(Command::opcode).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::Clear,
                Opcode::DrawArray,
                Opcode::Display,
                Opcode::RestoreState
            ]
        );
    }

    #[test]
    fn long_lists_drop_without_recursion() {
        let mut list = CommandList::new();
        for _ in 0..200_000 {
            list.push(Opcode::Clear, ArgBuffer::new());
        }
        drop(list);
    }

    #[test]
    fn unknown_raw_opcodes_are_preserved() {
        assert_eq!(Opcode::from_raw(0x0302), Some(Opcode::Display));
        assert_eq!(Opcode::from_raw(0x8001), None);
    }
}
