#[cfg(not(windows))]
mod fuzz {
    use std::io::{self, Cursor, Read};

    use honggfuzz::fuzz;
    use unsparse::format::sparse::SparseInputStream;

    // Headers can declare up to ~2^64 bytes of output from a few bytes of
    // input, so only a bounded prefix is expanded.
    const MAX_OUTPUT: u64 = 1 << 20;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(mut stream) = SparseInputStream::from_reader(Cursor::new(data)) {
                    let _ = io::copy(&mut (&mut stream).take(MAX_OUTPUT), &mut io::sink());
                }

                if let Ok(mut stream) = SparseInputStream::from_reader(Cursor::new(data)) {
                    for _ in 0..MAX_OUTPUT {
                        if !matches!(stream.read_byte(), Ok(Some(_))) {
                            break;
                        }
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
