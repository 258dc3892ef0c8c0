//! Pure-lopdf PDF transformations: merge, split, rotate, page removal,
//! and text overlays (watermark, page numbers). All functions read local
//! scratch files and return serialized bytes; nothing here touches the
//! repository or the artifact store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};

use shared::options::{PageRange, RemoveOptions, RotateOptions, SplitOptions};

/// Merges the provided PDF files into a single document, pages ordered as
/// submitted.
///
/// Each page subtree is imported into a fresh document through a
/// reference remap: shared resources are copied once per source file,
/// while source catalogs, outlines, and unreferenced objects never reach
/// the output.
pub fn merge(inputs: &[PathBuf]) -> Result<Vec<u8>> {
    if inputs.len() < 2 {
        bail!("merge needs at least two pdf inputs");
    }

    let mut merged = Document::with_version("1.5");
    let pages_root = merged.new_object_id();
    let mut kids: Vec<Object> = Vec::new();

    for input in inputs {
        let source =
            Document::load(input).with_context(|| format!("loading pdf {:?}", input))?;
        let ordered: Vec<ObjectId> = source.get_pages().into_values().collect();
        if ordered.is_empty() {
            bail!("{:?} contains no pages", input);
        }

        // Pre-register every page id so cross-page references (annotation
        // targets and the like) resolve while subtrees are copied.
        let mut remap: BTreeMap<ObjectId, ObjectId> = BTreeMap::new();
        for page_id in &ordered {
            remap.insert(*page_id, merged.new_object_id());
        }

        for page_id in ordered {
            let page = page_with_inherited(&source, page_id)?;
            let mut imported = Dictionary::new();
            for (key, value) in page.iter() {
                if key.as_slice() == b"Parent".as_slice() {
                    continue;
                }
                imported.set(
                    key.clone(),
                    import_object(&mut merged, &source, value, &mut remap)?,
                );
            }
            imported.set("Parent", pages_root);
            let new_id = remap[&page_id];
            merged.objects.insert(new_id, Object::Dictionary(imported));
            kids.push(new_id.into());
        }
    }

    merged.objects.insert(
        pages_root,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Count" => kids.len() as i64,
            "Kids" => kids,
        }),
    );
    let catalog_id = merged.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_root });
    merged.trailer.set("Root", catalog_id);
    save_to_vec(&mut merged)
}

/// Attributes a page may inherit from its parent nodes. The source page
/// tree is not copied, so these are pulled down onto the page itself.
const INHERITED_PAGE_KEYS: &[&[u8]] = &[b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

fn page_with_inherited(source: &Document, page_id: ObjectId) -> Result<Dictionary> {
    let mut page = source.get_object(page_id)?.as_dict()?.clone();
    for key in INHERITED_PAGE_KEYS {
        if page.get(key).is_ok() {
            continue;
        }
        let mut current = page_id;
        // hop limit guards against malformed cyclic page trees
        let mut hops = 0;
        while let Ok(Object::Reference(parent)) = source
            .get_object(current)
            .and_then(|obj| obj.as_dict())
            .and_then(|dict| dict.get(b"Parent"))
        {
            hops += 1;
            if hops > 64 {
                break;
            }
            current = *parent;
            let Ok(node) = source.get_object(current).and_then(|obj| obj.as_dict()) else {
                break;
            };
            if let Ok(value) = node.get(key) {
                page.set(*key, value.clone());
                break;
            }
        }
    }
    Ok(page)
}

/// Deep-copies `value` from `source` into `target`, allocating fresh ids
/// for referenced objects. `remap` records already-imported ids, which
/// also terminates reference cycles.
fn import_object(
    target: &mut Document,
    source: &Document,
    value: &Object,
    remap: &mut BTreeMap<ObjectId, ObjectId>,
) -> Result<Object> {
    match value {
        Object::Reference(id) => {
            if let Some(mapped) = remap.get(id) {
                return Ok(Object::Reference(*mapped));
            }
            let new_id = target.new_object_id();
            remap.insert(*id, new_id);
            let imported = match source.get_object(*id) {
                Ok(resolved) => import_object(target, source, resolved, remap)?,
                // dangling reference in the source; keep the slot valid
                Err(_) => Object::Null,
            };
            target.objects.insert(new_id, imported);
            Ok(Object::Reference(new_id))
        }
        Object::Array(items) => {
            let mut imported = Vec::with_capacity(items.len());
            for item in items {
                imported.push(import_object(target, source, item, remap)?);
            }
            Ok(Object::Array(imported))
        }
        Object::Dictionary(dict) => Ok(Object::Dictionary(import_dictionary(
            target, source, dict, remap,
        )?)),
        Object::Stream(stream) => {
            let dict = import_dictionary(target, source, &stream.dict, remap)?;
            let mut copied = stream.clone();
            copied.dict = dict;
            Ok(Object::Stream(copied))
        }
        other => Ok(other.clone()),
    }
}

fn import_dictionary(
    target: &mut Document,
    source: &Document,
    dict: &Dictionary,
    remap: &mut BTreeMap<ObjectId, ObjectId>,
) -> Result<Dictionary> {
    let mut imported = Dictionary::new();
    for (key, value) in dict.iter() {
        imported.set(key.clone(), import_object(target, source, value, remap)?);
    }
    Ok(imported)
}

/// ZIP entry name for one split part.
pub fn split_part_name(range: &PageRange) -> String {
    if range.is_single() {
        format!("split_page_{}.pdf", range.start)
    } else {
        format!("pages_{}-{}.pdf", range.start, range.end)
    }
}

/// Extracts every requested range as an independent PDF, in submission
/// order. Ranges beyond the document are fatal input errors.
pub fn split_parts(input: &Path, options: &SplitOptions) -> Result<Vec<(String, Vec<u8>)>> {
    let doc = Document::load(input).with_context(|| format!("loading pdf {:?}", input))?;
    let total = doc.get_pages().len() as u32;

    for range in &options.ranges {
        if range.end > total {
            bail!(
                "page range {}-{} exceeds the {total}-page document",
                range.start,
                range.end
            );
        }
    }

    let mut parts = Vec::with_capacity(options.ranges.len());
    for range in &options.ranges {
        let mut part = doc.clone();
        let drop_pages: Vec<u32> = (1..=total)
            .filter(|page| *page < range.start || *page > range.end)
            .collect();
        if !drop_pages.is_empty() {
            part.delete_pages(&drop_pages);
        }
        parts.push((split_part_name(range), save_to_vec(&mut part)?));
    }
    Ok(parts)
}

/// Adds `angle` to the `/Rotate` entry of the listed pages.
pub fn rotate(input: &Path, options: &RotateOptions) -> Result<Vec<u8>> {
    let mut doc = Document::load(input).with_context(|| format!("loading pdf {:?}", input))?;
    let pages = doc.get_pages();
    for page in &options.pages {
        let page_id = *pages.get(page).ok_or_else(|| {
            anyhow!("page {page} out of range (document has {} pages)", pages.len())
        })?;
        let current = match doc.get_object(page_id)?.as_dict()?.get(b"Rotate") {
            Ok(Object::Integer(n)) => *n,
            _ => 0,
        };
        let next = (current + i64::from(options.angle)).rem_euclid(360);
        doc.get_object_mut(page_id)?
            .as_dict_mut()?
            .set("Rotate", next);
    }
    save_to_vec(&mut doc)
}

/// Deletes the listed pages; at least one page must survive.
pub fn remove_pages(input: &Path, options: &RemoveOptions) -> Result<Vec<u8>> {
    let mut doc = Document::load(input).with_context(|| format!("loading pdf {:?}", input))?;
    let total = doc.get_pages().len() as u32;

    let mut targets: Vec<u32> = options.pages.clone();
    targets.sort_unstable();
    targets.dedup();
    for page in &targets {
        if *page < 1 || *page > total {
            bail!("page {page} out of range (document has {total} pages)");
        }
    }
    if targets.len() as u32 >= total {
        bail!("cannot remove every page of the document");
    }

    doc.delete_pages(&targets);
    save_to_vec(&mut doc)
}

/// Diagonal light-gray "DocSmart" overlay on every page.
pub fn add_watermark(input: &Path) -> Result<Vec<u8>> {
    let mut doc = Document::load(input).with_context(|| format!("loading pdf {:?}", input))?;
    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    for page_id in pages {
        let (width, height) = page_size(&doc, page_id);
        ensure_page_font(&mut doc, page_id, "Fw", font_id)?;
        let overlay = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["Fw".into(), 42.into()]),
                Operation::new(
                    "rg",
                    vec![
                        Object::Real(0.8),
                        Object::Real(0.8),
                        Object::Real(0.8),
                    ],
                ),
                // 45 degree text matrix anchored in the lower page half.
                Operation::new(
                    "Tm",
                    vec![
                        Object::Real(0.70711),
                        Object::Real(0.70711),
                        Object::Real(-0.70711),
                        Object::Real(0.70711),
                        Object::Real(width * 0.25),
                        Object::Real(height * 0.3),
                    ],
                ),
                Operation::new("Tj", vec![Object::string_literal("DocSmart")]),
                Operation::new("ET", vec![]),
                Operation::new("Q", vec![]),
            ],
        };
        append_page_ops(&mut doc, page_id, &overlay)?;
    }
    save_to_vec(&mut doc)
}

/// "Page N" footer centered at the bottom of every page.
pub fn add_page_numbers(input: &Path) -> Result<Vec<u8>> {
    let mut doc = Document::load(input).with_context(|| format!("loading pdf {:?}", input))?;
    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    for (index, page_id) in pages.iter().enumerate() {
        let (width, _) = page_size(&doc, *page_id);
        ensure_page_font(&mut doc, *page_id, "Fn", font_id)?;
        let label = format!("Page {}", index + 1);
        let overlay = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["Fn".into(), 12.into()]),
                Operation::new(
                    "rg",
                    vec![Object::Real(0.0), Object::Real(0.0), Object::Real(0.0)],
                ),
                Operation::new(
                    "Td",
                    vec![Object::Real(width / 2.0 - 24.0), Object::Real(24.0)],
                ),
                Operation::new("Tj", vec![Object::string_literal(label)]),
                Operation::new("ET", vec![]),
                Operation::new("Q", vec![]),
            ],
        };
        append_page_ops(&mut doc, *page_id, &overlay)?;
    }
    save_to_vec(&mut doc)
}

fn save_to_vec(doc: &mut Document) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).context("serializing pdf")?;
    Ok(bytes)
}

/// Appends overlay operations behind the page's existing content streams.
fn append_page_ops(doc: &mut Document, page_id: ObjectId, extra: &Content) -> Result<()> {
    let mut content = doc.get_page_content(page_id).unwrap_or_default();
    if !content.is_empty() && !content.ends_with(b"\n") {
        content.push(b'\n');
    }
    content.extend(extra.encode().context("encoding overlay content")?);
    doc.change_page_content(page_id, content)
        .context("rewriting page content")?;
    Ok(())
}

/// Clones the page's effective Resources (resolving references), extends
/// its Font map with `key`, and writes the result back inline so the
/// overlay operators can address the font.
fn ensure_page_font(
    doc: &mut Document,
    page_id: ObjectId,
    key: &str,
    font_id: ObjectId,
) -> Result<()> {
    let mut resources = match doc.get_object(page_id)?.as_dict()?.get(b"Resources") {
        Ok(Object::Dictionary(dict)) => dict.clone(),
        Ok(Object::Reference(id)) => doc.get_object(*id)?.as_dict()?.clone(),
        _ => Dictionary::new(),
    };
    let mut fonts = match resources.get(b"Font") {
        Ok(Object::Dictionary(dict)) => dict.clone(),
        Ok(Object::Reference(id)) => doc.get_object(*id)?.as_dict()?.clone(),
        _ => Dictionary::new(),
    };
    fonts.set(key, Object::Reference(font_id));
    resources.set("Font", Object::Dictionary(fonts));
    doc.get_object_mut(page_id)?
        .as_dict_mut()?
        .set("Resources", Object::Dictionary(resources));
    Ok(())
}

fn page_size(doc: &Document, page_id: ObjectId) -> (f32, f32) {
    let media_box = doc
        .get_object(page_id)
        .ok()
        .and_then(|obj| obj.as_dict().ok())
        .and_then(|dict| dict.get(b"MediaBox").ok())
        .and_then(|obj| obj.as_array().ok())
        .map(|arr| arr.iter().filter_map(object_as_f32).collect::<Vec<_>>());
    match media_box.as_deref() {
        Some([x0, y0, x1, y1]) => (x1 - x0, y1 - y0),
        // A4 portrait when the box is absent or inherited.
        _ => (595.0, 842.0),
    }
}

fn object_as_f32(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(n) => Some(*n as f32),
        Object::Real(n) => Some(*n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::Stream;
    use serde_json::json;
    use shared::options::{parse_page_ranges, rotate_options};
    use tempfile::tempdir;

    fn fixture_doc(texts: &[&str]) -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(
            dictionary! { "Type" => "Font", "Subtype" => "Type1", "BaseFont" => "Helvetica" },
        );
        let resources_id =
            doc.add_object(dictionary! { "Font" => dictionary! { "F1" => font_id } });
        let mut kids: Vec<Object> = Vec::new();
        for text in texts {
            let operations = vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 18.into()]),
                Operation::new("Td", vec![100.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ];
            let content = Content { operations };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            });
            kids.push(page_id.into());
        }
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => texts.len() as i64,
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    fn write_fixture(path: &Path, texts: &[&str]) {
        fixture_doc(texts).save(path).expect("save fixture pdf");
    }

    fn page_count(bytes: &[u8]) -> usize {
        Document::load_mem(bytes)
            .expect("parse produced pdf")
            .get_pages()
            .len()
    }

    fn texts_of(bytes: &[u8]) -> Vec<String> {
        let doc = Document::load_mem(bytes).expect("parse produced pdf");
        let total = doc.get_pages().len() as u32;
        (1..=total)
            .map(|page| {
                doc.extract_text(&[page])
                    .map(|t| t.trim().to_string())
                    .unwrap_or_default()
            })
            .collect()
    }

    #[test]
    fn merge_concatenates_in_submission_order() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        write_fixture(&a, &["A1", "A2"]);
        write_fixture(&b, &["B1", "B2", "B3"]);

        let merged = merge(&[a, b]).expect("merge works");
        assert_eq!(page_count(&merged), 5);
        let texts = texts_of(&merged);
        assert!(texts[0].contains("A1"));
        assert!(texts[1].contains("A2"));
        assert!(texts[2].contains("B1"));
        assert!(texts[4].contains("B3"));
    }

    #[test]
    fn merge_rejects_single_input() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        write_fixture(&a, &["A1"]);
        assert!(merge(&[a]).is_err());
    }

    #[test]
    fn split_produces_named_parts_with_selected_pages() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("c.pdf");
        let texts: Vec<String> = (1..=10).map(|n| format!("P{n}")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        write_fixture(&input, &refs);

        let options = SplitOptions {
            ranges: parse_page_ranges("1-3,5,8-10").unwrap(),
        };
        let parts = split_parts(&input, &options).expect("split works");
        assert_eq!(parts.len(), 3);

        assert_eq!(parts[0].0, "pages_1-3.pdf");
        assert_eq!(page_count(&parts[0].1), 3);
        assert!(texts_of(&parts[0].1)[0].contains("P1"));

        assert_eq!(parts[1].0, "split_page_5.pdf");
        assert_eq!(page_count(&parts[1].1), 1);
        assert!(texts_of(&parts[1].1)[0].contains("P5"));

        assert_eq!(parts[2].0, "pages_8-10.pdf");
        assert_eq!(page_count(&parts[2].1), 3);
        assert!(texts_of(&parts[2].1)[2].contains("P10"));
    }

    #[test]
    fn split_rejects_ranges_past_the_last_page() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("c.pdf");
        write_fixture(&input, &["P1", "P2"]);

        let options = SplitOptions {
            ranges: parse_page_ranges("1-5").unwrap(),
        };
        let err = split_parts(&input, &options).unwrap_err();
        assert!(err.to_string().contains("range"));
    }

    #[test]
    fn rotate_sets_and_wraps_the_rotation_entry() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("r.pdf");
        write_fixture(&input, &["P1", "P2"]);

        let options = rotate_options(&json!({"pages": [1], "angle": 90})).unwrap();
        let rotated = rotate(&input, &options).expect("rotate works");
        let doc = Document::load_mem(&rotated).unwrap();
        let pages = doc.get_pages();
        let first = doc.get_object(pages[&1]).unwrap().as_dict().unwrap();
        assert_eq!(first.get(b"Rotate").unwrap().as_i64().unwrap(), 90);
        // untouched page keeps no rotation entry
        let second = doc.get_object(pages[&2]).unwrap().as_dict().unwrap();
        assert!(second.get(b"Rotate").is_err());

        // two half turns cancel out
        let once = dir.path().join("once.pdf");
        std::fs::write(
            &once,
            rotate(&input, &rotate_options(&json!({"pages": [1], "angle": 180})).unwrap())
                .unwrap(),
        )
        .unwrap();
        let twice = rotate(
            &once,
            &rotate_options(&json!({"pages": [1], "angle": 180})).unwrap(),
        )
        .unwrap();
        let doc = Document::load_mem(&twice).unwrap();
        let pages = doc.get_pages();
        let first = doc.get_object(pages[&1]).unwrap().as_dict().unwrap();
        assert_eq!(first.get(b"Rotate").unwrap().as_i64().unwrap(), 0);
    }

    #[test]
    fn rotate_rejects_unknown_pages() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("r.pdf");
        write_fixture(&input, &["P1"]);
        let options = rotate_options(&json!({"pages": [4], "angle": 90})).unwrap();
        assert!(rotate(&input, &options).is_err());
    }

    #[test]
    fn remove_drops_pages_but_never_all_of_them() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("d.pdf");
        write_fixture(&input, &["P1", "P2", "P3", "P4", "P5"]);

        let out = remove_pages(
            &input,
            &RemoveOptions {
                pages: vec![2, 4],
            },
        )
        .expect("remove works");
        assert_eq!(page_count(&out), 3);
        let texts = texts_of(&out);
        assert!(texts[0].contains("P1"));
        assert!(texts[1].contains("P3"));
        assert!(texts[2].contains("P5"));

        assert!(remove_pages(
            &input,
            &RemoveOptions {
                pages: vec![1, 2, 3, 4, 5],
            },
        )
        .is_err());
        assert!(remove_pages(&input, &RemoveOptions { pages: vec![9] }).is_err());
    }

    #[test]
    fn watermark_keeps_pages_and_adds_overlay_text() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("w.pdf");
        write_fixture(&input, &["P1", "P2"]);

        let out = add_watermark(&input).expect("watermark works");
        assert_eq!(page_count(&out), 2);
        let texts = texts_of(&out);
        assert!(texts[0].contains("P1"));
        assert!(texts[0].contains("DocSmart"));
        assert!(texts[1].contains("DocSmart"));
    }

    #[test]
    fn page_numbers_label_every_page() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("n.pdf");
        write_fixture(&input, &["P1", "P2", "P3"]);

        let out = add_page_numbers(&input).expect("page numbers work");
        assert_eq!(page_count(&out), 3);
        let texts = texts_of(&out);
        assert!(texts[0].contains("Page 1"));
        assert!(texts[2].contains("Page 3"));
    }
}
