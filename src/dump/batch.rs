use crate::util::sql_escape::escape_identifier;

/// Assembles `INSERT INTO \`T\` VALUES (…), (…);` statements with at most
/// `max_rows` tuples each. The buffer always carries the statement prefix;
/// a flush terminates with `;\n`, hands out the bytes, and resets to the
/// bare prefix.
pub struct InsertBuffer {
    buf: Vec<u8>,
    prefix_len: usize,
    rows: usize,
    max_rows: usize,
}

impl InsertBuffer {
    pub fn new(table: &str, max_rows: usize) -> Self {
        let buf = format!("INSERT INTO {} VALUES ", escape_identifier(table)).into_bytes();
        let prefix_len = buf.len();

        Self {
            buf,
            prefix_len,
            rows: 0,
            max_rows: max_rows.max(1),
        }
    }

    /// Append one tuple; returns the finished statement when the batch
    /// reaches its row cap.
    pub fn push(&mut self, tuple: &[Vec<u8>]) -> Option<Vec<u8>> {
        if self.rows > 0 {
            self.buf.extend_from_slice(b", ");
        }

        self.buf.push(b'(');
        for (i, value) in tuple.iter().enumerate() {
            if i > 0 {
                self.buf.push(b',');
            }
            self.buf.extend_from_slice(value);
        }
        self.buf.push(b')');

        self.rows += 1;
        (self.rows == self.max_rows).then(|| self.flush())
    }

    /// Terminate and hand out the tail batch, if any.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        (self.rows > 0).then(|| self.flush())
    }

    fn flush(&mut self) -> Vec<u8> {
        self.buf.extend_from_slice(b";\n");

        let prefix = self.buf[..self.prefix_len].to_vec();
        self.rows = 0;
        std::mem::replace(&mut self.buf, prefix)
    }
}
