/// ESC/POS Commands (byte sequences)
const ESC: u8 = 0x1b;
const GS: u8 = 0x1d;
const LF: u8 = 0x0a;

/// Character table selected before receipt text (ESC t 6)
pub const RECEIPT_CODE_PAGE: u8 = 0x06;
/// Line spacing in motion units (ESC 3 32)
pub const RECEIPT_LINE_SPACING: u8 = 0x20;
/// Blank lines fed after the receipt body so the text clears the cutter
pub const TRAILING_FEED_LINES: u8 = 3;

/// Text alignment
#[derive(Debug, Clone, Copy)]
pub enum Alignment {
    Left = 0,
    Center = 1,
    Right = 2,
}

/// Paper cut mode (GS V)
#[derive(Debug, Clone, Copy)]
pub enum CutMode {
    Full = 0x00,
    Partial = 0x01,
    /// Feed n dots then full cut (GS V 66 n)
    FeedAndCut = 0x42,
}

/// ESC/POS Command Builder
#[derive(Debug, Default)]
pub struct ESCPOSBuilder {
    buffer: Vec<u8>,
}

impl ESCPOSBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the built command buffer
    pub fn build(self) -> Vec<u8> {
        self.buffer
    }

    /// Initialize printer (ESC @)
    pub fn initialize(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x40]);
        self
    }

    /// Select character code table (ESC t n)
    pub fn code_page(&mut self, page: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x74, page]);
        self
    }

    /// Set custom line spacing (ESC 3 n)
    pub fn line_spacing(&mut self, n: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x33, n]);
        self
    }

    /// Set text alignment (ESC a n)
    pub fn align(&mut self, alignment: Alignment) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x61, alignment as u8]);
        self
    }

    /// Enable/disable bold (ESC E n)
    pub fn bold(&mut self, enabled: bool) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x45, if enabled { 1 } else { 0 }]);
        self
    }

    /// Add text, UTF-8 encoded
    pub fn text(&mut self, text: &str) -> &mut Self {
        self.buffer.extend_from_slice(text.as_bytes());
        self
    }

    /// Add line feeds
    pub fn feed(&mut self, lines: u8) -> &mut Self {
        for _ in 0..lines {
            self.buffer.push(LF);
        }
        self
    }

    /// Cut paper. `FeedAndCut` takes the feed distance in dots; other modes ignore it.
    pub fn cut(&mut self, mode: CutMode, feed_dots: u8) -> &mut Self {
        match mode {
            CutMode::FeedAndCut => self.buffer.extend_from_slice(&[GS, 0x56, mode as u8, feed_dots]),
            _ => self.buffer.extend_from_slice(&[GS, 0x56, mode as u8]),
        }
        self
    }

    /// Write raw ESC/POS bytes
    pub fn raw(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(data);
        self
    }
}

/// Compile receipt text into the byte stream streamed to the printer.
///
/// Layout: reset, code table, line spacing, centered bold body, formatting
/// reset, trailing feeds. Pure and deterministic; the cut is sent separately
/// by [`print_trailer`] once every chunk has been acknowledged.
pub fn serialize_receipt(content: &str) -> Vec<u8> {
    let mut builder = ESCPOSBuilder::new();

    builder
        .initialize()
        .code_page(RECEIPT_CODE_PAGE)
        .line_spacing(RECEIPT_LINE_SPACING)
        .align(Alignment::Center)
        .bold(true)
        .text(content)
        .bold(false)
        .align(Alignment::Left)
        .feed(TRAILING_FEED_LINES);

    builder.build()
}

/// Paper cut followed by a printer re-initialize.
pub fn print_trailer() -> Vec<u8> {
    let mut builder = ESCPOSBuilder::new();
    builder.cut(CutMode::FeedAndCut, 0).initialize();
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_serialize_layout_is_byte_exact() {
        let bytes = serialize_receipt("AB");
        assert_eq!(
            bytes,
            vec![
                0x1B, 0x40, // reset
                0x1B, 0x74, 0x06, // code table
                0x1B, 0x33, 0x20, // line spacing
                0x1B, 0x61, 0x01, // center
                0x1B, 0x45, 0x01, // bold on
                b'A', b'B',
                0x1B, 0x45, 0x00, // bold off
                0x1B, 0x61, 0x00, // left
                0x0A, 0x0A, 0x0A,
            ]
        );
    }

    #[test]
    fn test_serialize_is_deterministic() {
        let content = "TICKET #42\nROUTE 7 -> DOWNTOWN\n";
        assert_eq!(serialize_receipt(content), serialize_receipt(content));
    }

    #[test]
    fn test_serialize_encodes_utf8() {
        let bytes = serialize_receipt("Café");
        let body = &bytes[14..bytes.len() - 9];
        assert_eq!(body, "Café".as_bytes());
        assert_eq!(body.len(), 5);
    }

    #[test]
    fn test_serialize_empty_content() {
        let bytes = serialize_receipt("");
        assert_eq!(bytes.len(), 14 + 9);
        assert_eq!(&bytes[..2], &[0x1B, 0x40]);
    }

    #[test]
    fn test_trailer_cut_then_reset() {
        assert_eq!(print_trailer(), vec![0x1D, 0x56, 0x42, 0x00, 0x1B, 0x40]);
    }

    #[test]
    fn test_builder_partial_cut_has_no_feed_byte() {
        let mut builder = ESCPOSBuilder::new();
        builder.cut(CutMode::Partial, 10).raw(&[0xFF]);
        assert_eq!(builder.build(), vec![0x1D, 0x56, 0x01, 0xFF]);
    }
}
