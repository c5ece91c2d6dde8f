//! Headless terminal used to redraw a pane's screen for a client that
//! reconnects without a replay marker.

use pmux_core::Dimensions;
use vt100::Parser;

pub struct Snapshot {
    parser: Parser,
}

impl Snapshot {
    pub fn new(dimensions: Dimensions) -> Self {
        Self {
            parser: Parser::new(dimensions.rows, dimensions.cols, 0),
        }
    }

    pub fn process(&mut self, data: &[u8]) {
        self.parser.process(data);
    }

    pub fn resize(&mut self, dimensions: Dimensions) {
        self.parser.set_size(dimensions.rows, dimensions.cols);
    }

    /// Render the visible screen: every cell of every row, rows separated
    /// by `\n\r`, then a cursor-position sequence. The right half of a wide
    /// character is not a cell of its own and is skipped.
    pub fn dump(&self) -> Vec<u8> {
        let screen = self.parser.screen();
        let (rows, cols) = screen.size();
        let mut view = String::with_capacity(rows as usize * (cols as usize + 2) + 16);
        for r in 0..rows {
            for c in 0..cols {
                match screen.cell(r, c) {
                    Some(cell) if cell.is_wide_continuation() => {}
                    Some(cell) if cell.has_contents() => view.push_str(&cell.contents()),
                    _ => view.push(' '),
                }
            }
            if r + 1 < rows {
                view.push_str("\n\r");
            }
        }
        let (row, col) = screen.cursor_position();
        view.push_str(&format!("\x1b[{};{}H", row + 1, col + 1));
        view.into_bytes()
    }
}
