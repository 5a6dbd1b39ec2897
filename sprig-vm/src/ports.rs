//! Input and output ports.
//!
//! Ports wrap host streams behind trait objects. Input ports decode UTF-8
//! multibyte sequences and keep a pushback buffer for `peek-char`.
//! A would-block error is surfaced to the dispatch loop, which parks the
//! thread through the blocker hook and retries the instruction.

use core::fmt;
use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};

/// An input or output port.
pub enum Port {
    /// Readable port.
    Input(InputPort),
    /// Writable port.
    Output(OutputPort),
}

/// Readable port state.
pub struct InputPort {
    reader: Box<dyn Read>,
    pushback: VecDeque<char>,
}

/// Writable port state.
pub struct OutputPort {
    writer: Box<dyn Write>,
}

impl Port {
    /// An input port over an arbitrary reader.
    pub fn input(reader: Box<dyn Read>) -> Port {
        Port::Input(InputPort {
            reader,
            pushback: VecDeque::new(),
        })
    }

    /// An input port over an in-memory buffer.
    pub fn input_from(data: impl Into<Vec<u8>>) -> Port {
        Port::input(Box::new(Cursor::new(data.into())))
    }

    /// An output port over an arbitrary writer.
    pub fn output(writer: Box<dyn Write>) -> Port {
        Port::Output(OutputPort { writer })
    }

    /// Whether this port is readable.
    pub fn is_input(&self) -> bool {
        matches!(self, Port::Input(_))
    }

    /// Whether this port is writable.
    pub fn is_output(&self) -> bool {
        matches!(self, Port::Output(_))
    }

    /// Read one character; `Ok(None)` at end of input. Errors pass through,
    /// including `WouldBlock`.
    pub fn read_char(&mut self) -> io::Result<Option<char>> {
        match self {
            Port::Input(p) => p.read_char(),
            Port::Output(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "not an input port")),
        }
    }

    /// Push a character back so the next read returns it again.
    pub fn push_char(&mut self, c: char) {
        if let Port::Input(p) = self {
            p.pushback.push_front(c);
        }
    }

    /// Read one character without consuming it.
    pub fn peek_char(&mut self) -> io::Result<Option<char>> {
        let c = self.read_char()?;
        if let Some(c) = c {
            self.push_char(c);
        }
        Ok(c)
    }

    /// Write one character, UTF-8 encoded.
    pub fn write_char(&mut self, c: char) -> io::Result<()> {
        let mut buf = [0u8; 4];
        self.write_str(c.encode_utf8(&mut buf))
    }

    /// Write a string.
    pub fn write_str(&mut self, s: &str) -> io::Result<()> {
        match self {
            Port::Output(p) => p.writer.write_all(s.as_bytes()),
            Port::Input(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "not an output port")),
        }
    }

    /// Write a newline.
    pub fn newline(&mut self) -> io::Result<()> {
        self.write_str("\n")
    }
}

impl InputPort {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn read_char(&mut self) -> io::Result<Option<char>> {
        if let Some(c) = self.pushback.pop_front() {
            return Ok(Some(c));
        }
        let Some(b0) = self.read_byte()? else {
            return Ok(None);
        };
        if b0 < 0x80 {
            return Ok(Some(b0 as char));
        }
        // Multibyte sequence length from the leading byte.
        let extra = match b0 {
            0xc0..=0xdf => 1,
            0xe0..=0xef => 2,
            0xf0..=0xf7 => 3,
            _ => 0,
        };
        let mut bytes = vec![b0];
        for _ in 0..extra {
            match self.read_byte()? {
                Some(b) => bytes.push(b),
                None => break,
            }
        }
        match core::str::from_utf8(&bytes) {
            Ok(s) => Ok(s.chars().next()),
            Err(_) => Ok(Some(char::REPLACEMENT_CHARACTER)),
        }
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Input(p) => f
                .debug_struct("InputPort")
                .field("pushback", &p.pushback.len())
                .finish(),
            Port::Output(_) => f.debug_struct("OutputPort").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_multibyte_characters() {
        let mut p = Port::input_from("aλ!".as_bytes().to_vec());
        assert_eq!(p.read_char().unwrap(), Some('a'));
        assert_eq!(p.read_char().unwrap(), Some('λ'));
        assert_eq!(p.read_char().unwrap(), Some('!'));
        assert_eq!(p.read_char().unwrap(), None);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut p = Port::input_from(b"xy".to_vec());
        assert_eq!(p.peek_char().unwrap(), Some('x'));
        assert_eq!(p.read_char().unwrap(), Some('x'));
        assert_eq!(p.read_char().unwrap(), Some('y'));
    }

    #[test]
    fn writes_are_utf8() {
        let buf: Vec<u8> = Vec::new();
        let shared = std::rc::Rc::new(std::cell::RefCell::new(buf));
        struct Sink(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);
        impl Write for Sink {
            fn write(&mut self, data: &[u8]) -> io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut p = Port::output(Box::new(Sink(shared.clone())));
        p.write_char('λ').unwrap();
        p.newline().unwrap();
        assert_eq!(&*shared.borrow(), "λ\n".as_bytes());
    }
}
