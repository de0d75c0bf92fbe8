//! Printable pre-diagnosis report: a fully-loaded detection rendered into a
//! static, self-contained HTML document. Read-only consumer of the record;
//! every interpolated value is HTML-escaped.

use std::fmt::Write as _;

use chrono::Utc;

use crate::models::{Detection, ReviewUrgency};

/// Short human-facing report id derived from the detection id.
pub fn report_id(detection_id: &str) -> String {
    let prefix: String = detection_id.chars().take(8).collect();
    format!("DET-{}", prefix.to_uppercase())
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn capitalize(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn urgency_color(urgency: Option<ReviewUrgency>) -> &'static str {
    match urgency {
        Some(ReviewUrgency::Urgent) => "#c0392b",
        Some(ReviewUrgency::Priority) => "#e67e22",
        _ => "#27ae60",
    }
}

fn urgency_message(urgency: Option<ReviewUrgency>) -> &'static str {
    match urgency {
        Some(ReviewUrgency::Urgent) => "Schedule immediate specialist consultation.",
        Some(ReviewUrgency::Priority) => "Follow-up recommended within 1-2 weeks.",
        _ => "Continue routine monitoring as scheduled.",
    }
}

fn section_heading(html: &mut String, title: &str) {
    let _ = write!(
        html,
        "<h2 style=\"font-size:14px;font-weight:700;text-transform:uppercase;\
         letter-spacing:1px;color:#2c3e50;border-bottom:2px solid #2c3e50;\
         padding-bottom:6px;margin-bottom:16px;\">{title}</h2>"
    );
}

fn labeled_row(html: &mut String, label: &str, value: &str) {
    let _ = write!(
        html,
        "<tr><td style=\"padding:8px 12px;border:1px solid #ddd;background:#f8f9fa;\
         font-weight:600;width:30%;\">{label}</td>\
         <td style=\"padding:8px 12px;border:1px solid #ddd;\">{value}</td></tr>"
    );
}

/// Render the report document.
pub fn render_report(detection: &Detection) -> String {
    let mut html = String::with_capacity(8 * 1024);

    let _ = write!(
        html,
        "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"UTF-8\" />\
         <title>BrightSight Report - {title}</title>\
         <style>\
         * {{ margin:0; padding:0; box-sizing:border-box; }}\
         body {{ font-family:'Segoe UI', Tahoma, Geneva, Verdana, sans-serif; color:#333;\
         line-height:1.5; padding:40px; max-width:800px; margin:0 auto; }}\
         @media print {{ body {{ padding:20px; }} }}\
         </style></head><body>",
        title = escape_html(&detection.patient_name)
    );

    // Header
    let _ = write!(
        html,
        "<div style=\"border-bottom:3px solid #2c3e50;padding-bottom:16px;margin-bottom:24px;\">\
         <h1 style=\"font-size:22px;font-weight:700;color:#2c3e50;margin-bottom:2px;\">\
         BRIGHTSIGHT EYE CLINIC</h1>\
         <p style=\"font-size:15px;color:#555;margin-bottom:8px;\">Pre-Diagnosis Report</p>\
         <div style=\"display:flex;justify-content:space-between;font-size:12px;color:#777;\">\
         <span>Report ID: {id}</span><span>Generated: {generated}</span></div></div>",
        id = report_id(&detection.id),
        generated = Utc::now().format("%Y-%m-%d %H:%M UTC"),
    );

    // Patient block
    html.push_str("<div style=\"margin-bottom:24px;\">");
    section_heading(&mut html, "Patient Information");
    html.push_str("<table style=\"width:100%;border-collapse:collapse;\">");
    labeled_row(&mut html, "Patient Name", &escape_html(&detection.patient_name));
    labeled_row(&mut html, "Age", &format!("{} years", detection.patient_age));
    labeled_row(
        &mut html,
        "Date of Analysis",
        &detection.created_at.format("%Y-%m-%d %H:%M UTC").to_string(),
    );
    labeled_row(&mut html, "Status", &capitalize(detection.status.as_str()));
    if !detection.remarks.is_empty() {
        labeled_row(&mut html, "Remarks", &escape_html(&detection.remarks));
    }
    html.push_str("</table></div>");

    // Fundus image, when the record carries one
    if let Some(image) = &detection.image_base64 {
        let src = if image.starts_with("data:") {
            image.clone()
        } else {
            format!("data:image/jpeg;base64,{image}")
        };
        html.push_str("<div style=\"margin-top:28px;text-align:center;\">");
        section_heading(&mut html, "Fundus Image");
        let _ = write!(
            html,
            "<img src=\"{src}\" alt=\"Fundus Image\" style=\"max-width:320px;\
             max-height:280px;border:1px solid #ddd;border-radius:4px;\" />\
             <p style=\"font-size:11px;color:#888;margin-top:6px;\">\
             Fundus photograph captured during examination</p></div>"
        );
    }

    // Classification result
    if let Some(classification) = detection.classification {
        html.push_str("<div style=\"margin-top:28px;\">");
        section_heading(&mut html, "Classification Result");
        let _ = write!(
            html,
            "<div style=\"background:#f0f4f8;border:1px solid #d0d7de;\
             border-left:4px solid #2c3e50;border-radius:4px;padding:16px;\">\
             <table style=\"width:100%;\">\
             <tr><td style=\"font-weight:600;padding:4px 0;width:30%;\">Classification</td>\
             <td style=\"font-size:16px;font-weight:700;color:#2c3e50;\">{name}</td></tr>\
             <tr><td style=\"font-weight:600;padding:4px 0;\">Confidence</td>\
             <td style=\"font-size:16px;font-weight:700;\">{confidence:.1}%</td></tr>\
             </table></div></div>",
            name = classification.display_name(),
            confidence = detection.confidence * 100.0,
        );
    }

    // Findings table
    if let Some(findings) = detection
        .preliminary_findings
        .as_ref()
        .filter(|f| !f.is_empty())
    {
        html.push_str("<div style=\"margin-top:28px;\">");
        section_heading(&mut html, "Preliminary Findings");
        html.push_str(
            "<table style=\"width:100%;border-collapse:collapse;\">\
             <thead><tr style=\"background:#2c3e50;color:#fff;\">\
             <th style=\"padding:8px 12px;border:1px solid #2c3e50;width:40px;\">#</th>\
             <th style=\"padding:8px 12px;border:1px solid #2c3e50;text-align:left;\">Finding</th>\
             <th style=\"padding:8px 12px;border:1px solid #2c3e50;width:120px;\">Status</th>\
             <th style=\"padding:8px 12px;border:1px solid #2c3e50;width:100px;\">Confidence</th>\
             </tr></thead><tbody>",
        );
        for (i, finding) in findings.iter().enumerate() {
            let (status, color) = if finding.detected {
                ("Detected", "#27ae60")
            } else {
                ("Not Detected", "#999")
            };
            let _ = write!(
                html,
                "<tr><td style=\"padding:8px 12px;border:1px solid #ddd;text-align:center;\
                 color:#555;\">{num}</td>\
                 <td style=\"padding:8px 12px;border:1px solid #ddd;\">{finding}</td>\
                 <td style=\"padding:8px 12px;border:1px solid #ddd;text-align:center;\">\
                 <span style=\"color:{color};font-weight:600;\">{status}</span></td>\
                 <td style=\"padding:8px 12px;border:1px solid #ddd;text-align:center;\">\
                 {tier}</td></tr>",
                num = i + 1,
                finding = escape_html(&finding.finding),
                tier = capitalize(finding.confidence.as_str()),
            );
        }
        html.push_str("</tbody></table></div>");
    }

    // Review recommendation
    html.push_str("<div style=\"margin-top:28px;\">");
    section_heading(&mut html, "Review Recommendation");
    let label = detection
        .review_urgency
        .map(|u| capitalize(u.as_str()))
        .unwrap_or_else(|| "Routine".to_string());
    let _ = write!(
        html,
        "<div style=\"padding:12px 16px;border-radius:4px;border-left:4px solid {color};\
         background:#fafafa;\">\
         <span style=\"font-weight:700;color:{color};font-size:15px;\">{label}</span>\
         <span style=\"color:#555;margin-left:8px;\">{message}</span></div></div>",
        color = urgency_color(detection.review_urgency),
        message = urgency_message(detection.review_urgency),
    );

    // Doctor review, present only once a doctor has signed off
    if let Some(review) = &detection.doctor_review {
        html.push_str("<div style=\"margin-top:28px;\">");
        section_heading(&mut html, "Doctor's Review");
        html.push_str("<table style=\"width:100%;border-collapse:collapse;\">");
        labeled_row(&mut html, "Reviewed By", &escape_html(&review.doctor_name));
        labeled_row(&mut html, "Severity", &capitalize(review.severity.as_str()));
        labeled_row(&mut html, "Clinical Diagnosis", &escape_html(&review.diagnosis));
        labeled_row(
            &mut html,
            "Recommendations",
            &escape_html(&review.recommendations),
        );
        labeled_row(
            &mut html,
            "Follow-up Date",
            &review
                .follow_up_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "Not scheduled".to_string()),
        );
        labeled_row(
            &mut html,
            "Reviewed On",
            &review.reviewed_at.format("%Y-%m-%d %H:%M UTC").to_string(),
        );
        html.push_str("</table></div>");
    }

    // Footer
    html.push_str(
        "<div style=\"margin-top:36px;border-top:1px solid #ddd;padding-top:12px;\
         font-size:11px;color:#888;\">\
         This is an automated pre-diagnosis screening report and is not a medical \
         diagnosis. All findings must be confirmed by a qualified ophthalmologist.\
         </div></body></html>",
    );

    html
}
