use std::path::Path;

use chrono::{DateTime, Utc};
use log::warn;
use printpdf::{BuiltinFont, Color, IndirectFontRef, Mm, PdfDocument, PdfLayerReference, Rgb};

use clubprint_settings::clubprint::{PdfColumn, PdfSettings};

use crate::error::ServiceError;
use crate::models::{Attendee, FeeStatus};

const PAGE_WIDTH_MM: f32 = 210.0;
const PAGE_HEIGHT_MM: f32 = 297.0;
const MARGIN_MM: f32 = 15.0;
const ROW_HEIGHT_MM: f32 = 8.0;
const LOGO_HEIGHT_MM: f32 = 18.0;
const TITLE_SIZE_PT: f32 = 16.0;

#[derive(Debug, Clone)]
pub struct SheetEvent {
    pub name: String,
    pub start_time: DateTime<Utc>,
}

fn pdf_err(err: impl std::fmt::Display) -> ServiceError {
    ServiceError::Pdf(err.to_string())
}

fn black() -> Color {
    Color::Rgb(Rgb::new(0.0, 0.0, 0.0, None))
}

fn status_color(status: FeeStatus) -> Color {
    match status {
        FeeStatus::Paid => Color::Rgb(Rgb::new(0.0, 0.5, 0.1, None)),
        FeeStatus::Owing => Color::Rgb(Rgb::new(0.8, 0.1, 0.1, None)),
        FeeStatus::NoFee => Color::Rgb(Rgb::new(0.45, 0.45, 0.45, None)),
    }
}

fn status_label(status: FeeStatus) -> &'static str {
    match status {
        FeeStatus::Paid => "Paid",
        FeeStatus::Owing => "Owing",
        FeeStatus::NoFee => "No fee",
    }
}

// Helvetica averages roughly half the point size per glyph; close enough to
// keep cell text inside its column.
fn fit_text(text: &str, width_mm: f32, font_size: f32) -> String {
    let avg_glyph_mm = font_size * 0.5 * 0.3528;
    let max_chars = (width_mm / avg_glyph_mm).floor() as usize;
    if text.chars().count() <= max_chars || max_chars < 2 {
        return text.to_string();
    }
    let mut fitted: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    fitted.push('…');
    fitted
}

fn cell_text(column: &PdfColumn, attendee: &Attendee) -> String {
    match column.id.as_str() {
        "name" => attendee.name.clone(),
        "phone" => attendee.phone.clone(),
        "sign_up_date" => attendee
            .sign_up_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        "fee" => attendee
            .fee
            .map(|fee| format!("${:.2}", fee))
            .unwrap_or_default(),
        "status" => status_label(attendee.fee_status).to_string(),
        // Unknown column ids render a blank cell.
        _ => String::new(),
    }
}

fn draw_header_row(
    layer: &PdfLayerReference,
    settings: &PdfSettings,
    bold: &IndirectFontRef,
    y: f32,
) {
    let font_size = settings.font_size;
    let mut x = MARGIN_MM;
    layer.set_fill_color(black());
    for column in &settings.columns {
        layer.use_text(
            fit_text(&column.header, column.width, font_size),
            font_size,
            Mm(x),
            Mm(y),
            bold,
        );
        x += column.width;
    }
}

fn embed_logo(layer: &PdfLayerReference, path: &Path, y_top: f32) {
    let result = (|| -> Result<(), String> {
        let file = std::fs::File::open(path).map_err(|e| e.to_string())?;
        let decoder =
            printpdf::image_crate::codecs::png::PngDecoder::new(std::io::BufReader::new(file))
                .map_err(|e| e.to_string())?;
        let image = printpdf::Image::try_from(decoder).map_err(|e| e.to_string())?;
        image.add_to_layer(
            layer.clone(),
            printpdf::ImageTransform {
                translate_x: Some(Mm(MARGIN_MM)),
                translate_y: Some(Mm(y_top - LOGO_HEIGHT_MM)),
                ..Default::default()
            },
        );
        Ok(())
    })();
    if let Err(err) = result {
        warn!("Skipping logo {:?}: {}", path, err);
    }
}

/// Render the attendee sheet. The byte buffer is fully flushed before this
/// returns, so callers may hand it straight to a sink.
pub fn build_attendee_sheet(
    settings: &PdfSettings,
    event: &SheetEvent,
    attendees: &[Attendee],
) -> Result<Vec<u8>, ServiceError> {
    let title = format!("Attendance: {}", event.name);
    let (doc, first_page, first_layer) =
        PdfDocument::new(&title, Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "Layer 1");
    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(pdf_err)?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(pdf_err)?;

    let font_size = settings.font_size;
    let mut layer = doc.get_page(first_page).get_layer(first_layer);
    let mut y = PAGE_HEIGHT_MM - MARGIN_MM;

    if let Some(logo) = &settings.logo {
        embed_logo(&layer, logo, y);
        y -= LOGO_HEIGHT_MM + 4.0;
    }

    layer.set_fill_color(black());
    layer.use_text(&title, TITLE_SIZE_PT, Mm(MARGIN_MM), Mm(y), &bold);
    y -= 7.0;
    layer.use_text(
        event
            .start_time
            .format("Starts %Y-%m-%d %H:%M UTC")
            .to_string(),
        font_size,
        Mm(MARGIN_MM),
        Mm(y),
        &font,
    );
    y -= ROW_HEIGHT_MM + 2.0;

    draw_header_row(&layer, settings, &bold, y);
    y -= ROW_HEIGHT_MM;

    for attendee in attendees {
        if y < MARGIN_MM + ROW_HEIGHT_MM {
            // Page break: fresh layer, repeated header row.
            let (page, page_layer) =
                doc.add_page(Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "Layer 1");
            layer = doc.get_page(page).get_layer(page_layer);
            y = PAGE_HEIGHT_MM - MARGIN_MM;
            draw_header_row(&layer, settings, &bold, y);
            y -= ROW_HEIGHT_MM;
        }
        let mut x = MARGIN_MM;
        for column in &settings.columns {
            let text = cell_text(column, attendee);
            if !text.is_empty() {
                if column.id == "status" {
                    layer.set_fill_color(status_color(attendee.fee_status));
                } else {
                    layer.set_fill_color(black());
                }
                layer.use_text(
                    fit_text(&text, column.width, font_size),
                    font_size,
                    Mm(x),
                    Mm(y),
                    &font,
                );
            }
            x += column.width;
        }
        layer.set_fill_color(black());
        y -= ROW_HEIGHT_MM;
    }

    doc.save_to_bytes().map_err(pdf_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeeStatus;

    fn attendee(name: &str, status: FeeStatus) -> Attendee {
        Attendee {
            name: name.to_string(),
            phone: "021 555 0100".to_string(),
            sign_up_date: Some(Utc::now()),
            fee: matches!(status, FeeStatus::Paid | FeeStatus::Owing).then_some(15.0),
            fee_status: status,
        }
    }

    fn sheet_event() -> SheetEvent {
        SheetEvent {
            name: "Practice".to_string(),
            start_time: Utc::now(),
        }
    }

    #[test]
    fn test_builds_pdf_with_roster() {
        let settings = PdfSettings::default();
        let attendees = vec![
            attendee("Ada Lovelace", FeeStatus::Paid),
            attendee("Grace Hopper", FeeStatus::Owing),
            attendee("Alan Turing", FeeStatus::NoFee),
        ];
        let bytes = build_attendee_sheet(&settings, &sheet_event(), &attendees).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn test_empty_roster_still_renders_header() {
        let settings = PdfSettings::default();
        let bytes = build_attendee_sheet(&settings, &sheet_event(), &[]).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn test_long_roster_breaks_pages() {
        let settings = PdfSettings::default();
        let attendees: Vec<Attendee> = (0..90)
            .map(|i| attendee(&format!("Member {}", i), FeeStatus::Paid))
            .collect();
        let long = build_attendee_sheet(&settings, &sheet_event(), &attendees).unwrap();
        let short = build_attendee_sheet(&settings, &sheet_event(), &attendees[..3]).unwrap();
        // The second page brings its own content stream.
        assert!(long.len() > short.len());
        assert!(long.starts_with(b"%PDF"));
    }

    #[test]
    fn test_unknown_column_renders_blank() {
        let mut settings = PdfSettings::default();
        settings.columns.push(PdfColumn {
            id: "shoe_size".to_string(),
            header: "Shoe".to_string(),
            width: 20.0,
        });
        let attendees = vec![attendee("Ada Lovelace", FeeStatus::Paid)];
        let bytes = build_attendee_sheet(&settings, &sheet_event(), &attendees).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn test_missing_logo_is_skipped() {
        let mut settings = PdfSettings::default();
        settings.logo = Some("/nonexistent/logo.png".into());
        let bytes = build_attendee_sheet(&settings, &sheet_event(), &[]).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn test_fit_text_truncates() {
        let fitted = fit_text("A very long attendee name indeed", 20.0, 10.0);
        assert!(fitted.chars().count() <= 12);
        assert!(fitted.ends_with('…'));
        assert_eq!(fit_text("Ada", 20.0, 10.0), "Ada");
    }
}
