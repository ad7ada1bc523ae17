//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

pub trait ReadExt {
    /// Reads until EOF and pads the result with 0xFF up to a whole number of pages.
    ///
    /// An empty input yields an empty vector.
    fn read_pages(&mut self, page_size: usize) -> io::Result<Vec<u8>>;
}

impl<T: Read> ReadExt for T {
    fn read_pages(&mut self, page_size: usize) -> io::Result<Vec<u8>> {
        let mut vec = Vec::new();
        self.read_to_end(&mut vec)?;

        let padded = vec.len().div_ceil(page_size) * page_size;
        vec.resize(padded, 0xFF);
        Ok(vec)
    }
}

#[test]
fn test_read_pages() -> io::Result<()> {
    let pages = (&[1u8, 2, 3][..]).read_pages(4)?;
    assert_eq!(pages, [1, 2, 3, 0xFF]);

    let pages = (&[0xAAu8; 8][..]).read_pages(4)?;
    assert_eq!(pages, [0xAA; 8]);

    assert!(io::empty().read_pages(4)?.is_empty());
    assert!([0xFFu8; 16].is_erased());
    assert!(![0xFFu8, 0x7F].is_erased());
    Ok(())
}
