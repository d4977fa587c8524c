use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::hash::Hash;
use std::io::{BufRead, BufReader};

use itertools::Itertools;

pub trait Statistic {
    fn mean(&self) -> f64;
    fn stat(&self, ddof: usize) -> (f64, f64);
    fn argsort(&self, ascending: bool) -> (Vec<usize>, Vec<f64>);
    fn average_rank(&self) -> Vec<f64>;
}

impl Statistic for &[f64] {
    /// caculate mean
    fn mean(&self) -> f64 {
        let sum = self.iter().sum::<f64>();
        let count = self.len() as f64;
        sum / count
    }
    /// return (mean, std)
    fn stat(&self, ddof: usize) -> (f64, f64) {
        let count = self.len();
        let mean = self.mean();
        if count <= ddof {
            return (mean, 0.0);
        }
        let variance = self
            .iter()
            .map(|&value| {
                let diff = mean - value;
                diff * diff
            })
            .sum::<f64>()
            / ((count - ddof) as f64);
        (mean, variance.sqrt())
    }
    /// stable sort: equal values keep their input order in both directions
    fn argsort(&self, ascending: bool) -> (Vec<usize>, Vec<f64>) {
        let sorted_col: Vec<(usize, &f64)> = self
            .iter()
            .enumerate()
            .sorted_by(|&a, &b| {
                if ascending {
                    a.1.total_cmp(b.1)
                } else {
                    b.1.total_cmp(a.1)
                }
            })
            .collect();
        sorted_col.into_iter().map(|(i, &v)| (i, v)).unzip()
    }
    /// 1-based ranks, ties get the mean of the positions they span
    fn average_rank(&self) -> Vec<f64> {
        let (sidx, sval) = self.argsort(true);
        let mut ranks = vec![0.0; self.len()];
        let mut start = 0;
        while start < sval.len() {
            let mut end = start + 1;
            while end < sval.len() && sval[end] == sval[start] {
                end += 1;
            }
            // positions start..end hold ranks start+1..=end
            let avg = (start + 1 + end) as f64 / 2.0;
            sidx[start..end].iter().for_each(|&i| ranks[i] = avg);
            start = end;
        }
        ranks
    }
}

/// Dynamic Enum
#[derive(Debug, Clone)]
pub struct DynamicEnum<T> {
    _elt_to_idx: HashMap<T, usize>, // element to index
    _idx_to_elt: Vec<T>,            // index to element
    _num_indices: usize,            // size
}

impl<T> Default for DynamicEnum<T>
where
    T: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DynamicEnum<T>
where
    T: Eq + Hash + Clone,
{
    /// an empty object
    pub fn new() -> Self {
        DynamicEnum {
            _num_indices: 0,
            _idx_to_elt: Vec::<T>::new(),
            _elt_to_idx: HashMap::<T, usize>::new(),
        }
    }
    /// construct from vec. the first duplicated element is returned as error
    pub fn try_from_slice(vec: &[T]) -> Result<Self, T> {
        let mut de = DynamicEnum::new();
        for v in vec.iter() {
            if de.contain_elt(v) {
                return Err(v.clone());
            }
            de.add_if_new(v.clone());
        }
        Ok(de)
    }
    /// add element if new
    /// return indices whether new or not
    pub fn add_if_new(&mut self, element: T) -> usize {
        if let Some(&idx) = self._elt_to_idx.get(&element) {
            return idx;
        }
        let key = element.clone();
        let idx = self._num_indices;
        self._idx_to_elt.push(element);
        self._elt_to_idx.insert(key, idx);
        self._num_indices += 1;
        idx
    }
    /// get index of element
    pub fn index_of(&self, element: &T) -> Option<&usize> {
        self._elt_to_idx.get(element)
    }
    pub fn index_of_any(&self, elements: &[T]) -> Vec<&usize> {
        elements.iter().filter_map(|e| self.index_of(e)).collect()
    }
    pub fn contain_elt(&self, element: &T) -> bool {
        self._elt_to_idx.contains_key(element)
    }
    /// get element at position of index
    pub fn elt_of(&self, idx: usize) -> Option<&T> {
        self._idx_to_elt.get(idx)
    }
    pub fn get_vec(&self) -> &Vec<T> {
        &self._idx_to_elt
    }

}

pub struct FileReader {
    lineno: usize,
    pub header: DynamicEnum<String>,
    pub record: Vec<Vec<String>>,
}

impl Default for FileReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FileReader {
    pub fn new() -> Self {
        FileReader {
            lineno: 0,
            header: DynamicEnum::<String>::new(),
            record: Vec::<Vec<String>>::new(), // 2d vec init
        }
    }
    /// delimiter, comment: byte char literal input, e.g.  b'\t', b'#'
    pub fn read_csv(
        &mut self,
        file_path: &str,
        delimiter: u8,
        header: bool,
        comment: Option<u8>,
    ) -> Result<(), Box<dyn Error>> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(header)
            .comment(comment)
            .flexible(true)
            .from_path(file_path)
            .map_err(|e| format!("cannot read {file_path}: {e}"))?;
        if header {
            let _h = rdr.headers()?;
            for col in _h.iter() {
                self.header.add_if_new(col.to_string());
            }
        }
        for result in rdr.records() {
            self.lineno += 1;
            let record = result?;
            self.record
                .push(record.iter().map(|x| x.trim().to_string()).collect());
        }
        Ok(())
    }

    pub fn read_table(
        &mut self,
        file_path: &str,
        delimiter: char,
        header: bool,
    ) -> Result<(), Box<dyn Error>> {
        let input = File::open(file_path)?;
        let mut buffered = BufReader::new(input);
        if header {
            let mut _header: String = String::new();
            buffered.read_line(&mut _header)?;
            for col in _header.trim_end().split(delimiter) {
                self.header.add_if_new(col.to_string());
            }
        }
        for (_num, line) in buffered.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Vec<String> = line.split(delimiter).map(|x| x.to_string()).collect();
            self.record.push(record);
            self.lineno = _num;
        }
        Ok(())
    }

    /// number of data lines consumed so far
    pub fn lines_read(&self) -> usize {
        self.lineno
    }
}
