//! hOCR inspection helpers.
//!
//! Pure functions over the markup string: a shape check used to keep the two
//! output modes apart, and word extraction with bounding boxes.

use std::sync::OnceLock;

use regex::Regex;

/// A recognized word and its `bbox` (x0, y0, x1, y1) in image pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HocrWord {
    pub text: String,
    pub bbox: [u32; 4],
}

fn ocr_class() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"class=['"]ocrx?_\w+['"]"#).expect("valid regex"))
}

fn bbox_title() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"title=['"][^'"]*\bbbox \d+ \d+ \d+ \d+"#).expect("valid regex")
    })
}

fn word_span() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<span[^>]*class=['"]ocrx_word['"][^>]*title=['"]bbox (\d+) (\d+) (\d+) (\d+)[^'"]*['"][^>]*>(.*?)</span>"#,
        )
        .expect("valid regex")
    })
}

fn inner_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid regex"))
}

/// True when `s` carries hOCR structure: `ocr_*`/`ocrx_*` classes with
/// `bbox` geometry.
pub fn is_positional_markup(s: &str) -> bool {
    ocr_class().is_match(s) && bbox_title().is_match(s)
}

/// Extract the `ocrx_word` spans of an hOCR document, in document order.
pub fn words(hocr: &str) -> Vec<HocrWord> {
    word_span()
        .captures_iter(hocr)
        .filter_map(|caps| {
            let coord = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();
            let bbox = [coord(1)?, coord(2)?, coord(3)?, coord(4)?];
            let text = decode_entities(&inner_tag().replace_all(&caps[5], ""));
            let text = text.trim();
            if text.is_empty() {
                None
            } else {
                Some(HocrWord {
                    text: text.to_string(),
                    bbox,
                })
            }
        })
        .collect()
}

fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
pub(crate) const SAMPLE_HOCR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xml:lang="en" lang="en">
 <body>
  <div class='ocr_page' id='page_1' title='image "/tmp/sample.png"; bbox 0 0 200 60; ppageno 0'>
   <div class='ocr_carea' id='block_1_1' title="bbox 20 15 130 45">
    <p class='ocr_par' id='par_1_1' lang='eng' title="bbox 20 15 130 45">
     <span class='ocr_line' id='line_1_1' title="bbox 20 15 130 45; baseline 0 0; x_size 30">
      <span class='ocrx_word' id='word_1_1' title='bbox 20 15 130 45; x_wconf 95'><strong>HELLO</strong></span>
      <span class='ocrx_word' id='word_1_2' title='bbox 140 15 180 45; x_wconf 88'>R&amp;D</span>
     </span>
    </p>
   </div>
  </div>
 </body>
</html>
"#;
