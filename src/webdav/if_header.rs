//! If 请求头解析
//!
//!   If = ( 1*No-tag-list | 1*Tagged-list )
//!   Tagged-list = Resource-Tag 1*List
//!   List = "(" 1*Condition ")"
//!   Condition = ["Not"] (State-token | "[" entity-tag "]")

/// 单个条件：锁令牌或 ETag，可被 Not 取反
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Condition {
    pub not: bool,
    pub token: String,
    pub etag: String,
}

/// 一个条件列表，条件之间为“与”关系
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfList {
    /// 资源标签（绝对 URL），为空表示作用于请求目标
    pub resource_tag: String,
    pub conditions: Vec<Condition>,
}

/// 多个列表之间为“或”关系
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfHeader {
    pub lists: Vec<IfList>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Char(u8),
    Str(&'a str),
    Not,
    Angle(&'a str),
    Square(&'a str),
    Eof,
    Err,
}

fn lex(s: &str) -> (Token<'_>, &str) {
    let s = s.trim_start_matches([' ', '\t']);
    if s.is_empty() {
        return (Token::Eof, "");
    }

    let bytes = s.as_bytes();
    let i = bytes
        .iter()
        .position(|b| matches!(b, b'\t' | b' ' | b'(' | b')' | b'<' | b'>' | b'[' | b']'))
        .unwrap_or(bytes.len());
    if i != 0 {
        let (word, rest) = s.split_at(i);
        if word == "Not" {
            return (Token::Not, rest);
        }
        return (Token::Str(word), rest);
    }

    let (close, angle) = match bytes[0] {
        b'<' => (b'>', true),
        b'[' => (b']', false),
        c => return (Token::Char(c), &s[1..]),
    };
    match s.bytes().position(|b| b == close) {
        Some(j) => {
            let inner = &s[1..j];
            let tok = if angle {
                Token::Angle(inner)
            } else {
                Token::Square(inner)
            };
            (tok, &s[j + 1..])
        }
        None => (Token::Err, ""),
    }
}

fn parse_condition(s: &str) -> Option<(Condition, &str)> {
    let mut cond = Condition::default();
    let (mut tok, mut rest) = lex(s);
    if tok == Token::Not {
        cond.not = true;
        (tok, rest) = lex(rest);
    }
    match tok {
        Token::Str(t) | Token::Angle(t) => cond.token = t.to_string(),
        Token::Square(e) => cond.etag = e.to_string(),
        _ => return None,
    }
    Some((cond, rest))
}

fn parse_list(s: &str) -> Option<(IfList, &str)> {
    let (tok, mut s) = lex(s);
    if tok != Token::Char(b'(') {
        return None;
    }
    let mut list = IfList::default();
    loop {
        let (tok, rest) = lex(s);
        if tok == Token::Char(b')') {
            if list.conditions.is_empty() {
                return None;
            }
            return Some((list, rest));
        }
        let (cond, rest) = parse_condition(s)?;
        list.conditions.push(cond);
        s = rest;
    }
}

fn parse_no_tag_lists(mut s: &str) -> Option<IfHeader> {
    let mut header = IfHeader::default();
    loop {
        let (list, rest) = parse_list(s)?;
        header.lists.push(list);
        if rest.trim().is_empty() {
            return Some(header);
        }
        s = rest;
    }
}

fn parse_tagged_lists(mut s: &str) -> Option<IfHeader> {
    let mut header = IfHeader::default();
    let mut tag = String::new();
    let mut lists_for_tag = 0;
    let mut first = true;
    loop {
        let (tok, rest) = lex(s);
        match tok {
            Token::Angle(t) => {
                // 资源标签后至少要有一个列表
                if !first && lists_for_tag == 0 {
                    return None;
                }
                tag = t.to_string();
                lists_for_tag = 0;
                s = rest;
            }
            Token::Char(b'(') => {
                lists_for_tag += 1;
                let (mut list, rest) = parse_list(s)?;
                list.resource_tag = tag.clone();
                header.lists.push(list);
                if rest.trim().is_empty() {
                    return Some(header);
                }
                s = rest;
            }
            _ => return None,
        }
        first = false;
    }
}

/// 解析 If 头，格式错误返回 None
pub fn parse_if_header(value: &str) -> Option<IfHeader> {
    let s = value.trim();
    match lex(s).0 {
        Token::Char(b'(') => parse_no_tag_lists(s),
        Token::Angle(_) => parse_tagged_lists(s),
        _ => None,
    }
}
